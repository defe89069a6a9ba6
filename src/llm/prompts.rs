//! 提示词模板
//!
//! 生成程序时只给文档元信息（大小、类型、摘要前缀），从不给文档正文；子查询附带父级记忆。

use crate::engine::ContextInfo;
use crate::memory::{memory_json, Memory};

/// 生成程序的 system prompt
pub const PROGRAM_SYSTEM_PROMPT: &str = r#"You are a recursive agent that processes large documents by writing short Rhai programs.

Your program runs in a sandbox with these values and functions:
- `context`: the full document as a string (may be 500K+ characters)
- `context.len()`: number of characters in the document
- `context.sub_string(start, length)`: a slice of the document
- `chunks(text, size)`: split text into an array of pieces of at most `size` characters
- `delegate(prompt)`: ask a child agent a question and get its answer as a string; the prompt may include document text
- `complete(result)`: finish with your final answer. YOU MUST call this exactly once; nothing after it runs.
- `memory_get(key)` / `memory_get(key, default)`: read persistent memory from previous runs
- `memory_set(key, value)`: store a value in persistent memory for future runs
- `memory`: read-only map of the memory at the start of this run
- `print(value)`: write a diagnostic line to the execution log

IMPORTANT RULES:
1. NEVER put the whole document into one prompt - it is too large!
2. Split the document into chunks and process each chunk with delegate()
3. For summarization or extraction, process chunks and then combine the partial results
4. For search, scan chunks for relevant sections, then analyse those sections
5. Always finish with complete(result)
6. Keep the program short and readable
7. Use try/catch around delegate() if a failed chunk should not abort the run

Example:
```rhai
let pieces = chunks(context, 45000);
let notes = [];
for (piece, i) in pieces {
    notes.push(delegate(`Extract the key facts from part ${i + 1}/${pieces.len()}:\n${piece}`));
}
let summary = delegate("Combine these facts into one coherent summary:\n" + notes.reduce(|acc, n| acc + "\n---\n" + n, ""));
complete(summary);
```

Write a Rhai program that answers the user's query. Output ONLY the program, no explanations."#;

/// 子查询的 system prompt
pub const CHILD_SYSTEM_PROMPT: &str = r#"You are a child agent helping to process a large document.

You receive a specific prompt from the parent agent and should provide a direct, helpful answer.
Focus on the specific task given to you. Be concise but thorough.

If you're asked to extract information, provide it in a structured format.
If you're asked to summarize, be comprehensive but concise.
If you're asked to analyze, provide clear insights."#;

/// 递归子 Agent 的固定查询（文档即委派的 prompt）
pub const RECURSIVE_CHILD_QUERY: &str = "Process and respond to this request";

/// 生成程序的 user 消息
pub fn program_message(query: &str, info: &ContextInfo, memory: &Memory) -> String {
    let hash_prefix: String = info.hash.chars().take(16).collect();
    let hash_prefix = if hash_prefix.is_empty() {
        "none".to_string()
    } else {
        hash_prefix
    };
    format!(
        "Context Information:\n\
         - Size: {} characters\n\
         - Type: {}\n\
         - Hash: {}...\n\n\
         Memory from previous runs:\n{}\n\n\
         User Query: {}\n\n\
         Generate a Rhai program to answer this query. Remember to call complete(result) at the end.",
        info.size,
        info.kind,
        hash_prefix,
        memory_json(memory).unwrap_or_else(|| "No previous memory".to_string()),
        query
    )
}

/// 子查询的 user 消息
pub fn child_message(prompt: &str, parent_memory: &Memory) -> String {
    format!(
        "Memory context (from parent agent):\n{}\n\nTask: {}",
        memory_json(parent_memory).unwrap_or_else(|| "No memory context".to_string()),
        prompt
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_program_message_never_contains_document() {
        let document = "SECRET-BODY ".repeat(1000);
        let info = ContextInfo::from_document(&document);
        let msg = program_message("summarize", &info, &Memory::new());
        assert!(!msg.contains("SECRET-BODY SECRET-BODY SECRET-BODY"));
        assert!(msg.contains("Size: 12000 characters"));
        assert!(msg.contains("No previous memory"));
        assert!(msg.contains(&info.hash[..16]));
    }

    #[test]
    fn test_child_message_includes_memory() {
        let mut memory = Memory::new();
        memory.insert("topic".into(), json!("rust"));
        let msg = child_message("what is this?", &memory);
        assert!(msg.contains("\"topic\""));
        assert!(msg.ends_with("Task: what is this?"));
    }
}
