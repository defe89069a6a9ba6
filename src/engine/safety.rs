//! 执行前的词法检查：去掉代码围栏，再按黑名单正则扫描
//!
//! 这只是粗粒度的 linter，可被间接写法绕过；真正的限制来自沙箱只注册了有限的能力函数。

use std::sync::OnceLock;

use regex::Regex;

/// (名称, 模式)：进程 / 系统模块导入、动态求值与编译、原始文件句柄、脚本模块导入
const DENYLIST: &[(&str, &str)] = &[
    ("import os", r"\bimport\s+os\b"),
    ("import subprocess", r"\bimport\s+subprocess\b"),
    ("import sys", r"\bimport\s+sys\b"),
    ("__import__", r"\b__import__\b"),
    ("eval", r"\beval\s*\("),
    ("exec", r"\bexec\s*\("),
    ("open", r"\bopen\s*\("),
    ("file", r"\bfile\s*\("),
    ("compile", r"\bcompile\s*\("),
    ("module import", r#"\bimport\s+""#),
];

static PATTERNS: OnceLock<Vec<(&'static str, &'static str, Regex)>> = OnceLock::new();
static FENCES: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();

fn patterns() -> &'static [(&'static str, &'static str, Regex)] {
    PATTERNS.get_or_init(|| {
        DENYLIST
            .iter()
            .filter_map(|(label, pat)| Regex::new(pat).ok().map(|re| (*label, *pat, re)))
            .collect()
    })
}

fn fences() -> Option<&'static (Regex, Regex)> {
    FENCES
        .get_or_init(|| {
            let open = Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*\r?\n?").ok()?;
            let close = Regex::new(r"\r?\n?```\s*$").ok()?;
            Some((open, close))
        })
        .as_ref()
}

/// 命中黑名单的构造
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisallowedConstruct {
    pub label: &'static str,
    pub pattern: &'static str,
}

impl std::fmt::Display for DisallowedConstruct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DisallowedConstruct: `{}` is not allowed (pattern {})",
            self.label, self.pattern
        )
    }
}

/// 去掉首尾的 markdown 代码围栏（```rhai / ``` 等）
pub fn strip_code_fences(program: &str) -> String {
    let trimmed = program.trim();
    let Some((open, close)) = fences() else {
        return trimmed.to_string();
    };
    let without_open = open.replace(trimmed, "");
    let without_close = close.replace(without_open.trim_end(), "");
    without_close.trim().to_string()
}

/// 扫描黑名单；命中第一个即返回
pub fn check(program: &str) -> Result<(), DisallowedConstruct> {
    for (label, pattern, re) in patterns() {
        if re.is_match(program) {
            return Err(DisallowedConstruct {
                label: *label,
                pattern: *pattern,
            });
        }
    }
    Ok(())
}

/// 去围栏 + 检查，返回可执行的程序文本
pub fn sanitize(program: &str) -> Result<String, DisallowedConstruct> {
    let code = strip_code_fences(program);
    check(&code)?;
    Ok(code)
}
