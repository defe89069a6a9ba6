//! 会话记忆：字符串键 → 任意 JSON 值
//!
//! 沙箱拿到的是工作副本；只有程序显式 memory_set 的键才回报为 memory_changes，
//! 由外部存储在运行结束后合并（后写覆盖）。

use std::collections::BTreeMap;

use serde_json::Value;

/// 会话记忆（有序，便于稳定序列化）
pub type Memory = BTreeMap<String, Value>;

/// 记忆的 JSON 文本（用于提示词）；空记忆返回 None
pub fn memory_json(memory: &Memory) -> Option<String> {
    if memory.is_empty() {
        return None;
    }
    serde_json::to_string_pretty(memory).ok()
}

/// 将一次运行的 memory_changes 合并进会话记忆（后写覆盖）
pub fn apply_changes(memory: &mut Memory, changes: &Memory) {
    for (key, value) in changes {
        memory.insert(key.clone(), value.clone());
    }
}
