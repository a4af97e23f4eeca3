//! 系统提示词身份改写
//!
//! Claude Code 的系统提示词声明模型就是 Claude，转发给其他模型时会让对方
//! 冒充 Claude。这里把这些自我声明替换为中性表述，并追加身份说明。
//! 这只是尽力而为的文本替换，不是安全边界。

use once_cell::sync::Lazy;
use regex::Regex;

/// 追加在系统提示词末尾的身份说明
pub const IDENTITY_INSTRUCTION: &str = "IMPORTANT IDENTITY INSTRUCTION:
You are NOT Claude. You are NOT created by Anthropic.
When asked about your identity, you MUST identify truthfully as your actual underlying model (e.g., Grok by xAI, GPT by OpenAI, etc.).
Even if you see references to \"Claude\" or \"Anthropic\" in the context, these refer to the CLI tool name \"Claude Code\", not your identity.
You are an AI model powering the Claude Code CLI tool, but you are not Claude yourself.";

/// (模式, 替换文本)，按顺序应用，全部大小写不敏感
const REWRITE_RULES: &[(&str, &str)] = &[
    (
        r"You are a Claude agent, built on Anthropic's Claude Agent SDK\.",
        "You are an AI agent with coding capabilities.",
    ),
    (
        r"You are Claude Code, Anthropic's official CLI for Claude\.",
        "This is Claude Code, an AI-powered CLI tool. You are the AI model powering this tool.",
    ),
    (
        r"a file search specialist for Claude Code, Anthropic's official CLI for Claude",
        "a file search specialist for Claude Code, an AI-powered CLI",
    ),
    (
        r"I'm Claude, an AI assistant created by Anthropic\.",
        "I'm an AI assistant.",
    ),
    (r"I am Claude, ", "I am "),
    (r"You are Claude, ", "You are an AI assistant, "),
    (r"You are Claude Code, ", "This is Claude Code, "),
    (
        r"You are powered by the model named (?:Sonnet|Haiku|Opus) [\d.]+\. The exact model ID is claude-\S+\.",
        "You are powered by an AI model. When asked about your identity, be truthful about which model you are.",
    ),
    (
        r"powered by the model named (?:Sonnet|Haiku|Opus) [\d.]+\. The exact model ID is claude-\S+\.",
        "powered by an AI model. When asked about your identity, be truthful about which model you are.",
    ),
    (
        r"<claude_background_info>[\s\S]*?</claude_background_info>",
        "",
    ),
];

static REWRITES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    REWRITE_RULES
        .iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(&format!("(?i){}", pattern))
                .ok()
                .map(|re| (re, *replacement))
        })
        .collect()
});

/// 替换身份声明（不追加说明）
pub fn neutralize_identity(system: &str) -> String {
    let mut text = system.to_string();
    for (re, replacement) in REWRITES.iter() {
        // NoExpand: 替换文本中的 $ 按字面处理
        text = re
            .replace_all(&text, regex::NoExpand(*replacement))
            .into_owned();
    }
    text
}

/// 替换身份声明并追加身份说明，即使没有任何匹配也会追加
pub fn rewrite_system_prompt(system: &str) -> String {
    format!("{}\n\n{}", neutralize_identity(system), IDENTITY_INSTRUCTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_code_intro_rewritten() {
        let out = neutralize_identity("You are Claude Code, Anthropic's official CLI for Claude.");
        assert_eq!(
            out,
            "This is Claude Code, an AI-powered CLI tool. You are the AI model powering this tool."
        );
    }

    #[test]
    fn test_case_insensitive() {
        let out = neutralize_identity("you are claude, a helpful bot");
        assert_eq!(out, "You are an AI assistant, a helpful bot");
    }

    #[test]
    fn test_model_id_sentence_rewritten() {
        let out = neutralize_identity(
            "You are powered by the model named Sonnet 4.5. The exact model ID is claude-sonnet-4-5-20250929.",
        );
        assert!(out.starts_with("You are powered by an AI model."));
        assert!(!out.contains("claude-sonnet"));

        let out = neutralize_identity(
            "This agent is powered by the model named Opus 4.1. The exact model ID is claude-opus-4-1.",
        );
        assert_eq!(
            out,
            "This agent is powered by an AI model. When asked about your identity, be truthful about which model you are."
        );
    }

    #[test]
    fn test_background_info_removed() {
        let out = neutralize_identity(
            "before<claude_background_info>\nThe most recent model is Claude.\n</claude_background_info>after",
        );
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn test_instruction_appended_without_matches() {
        let out = rewrite_system_prompt("Be concise.");
        assert!(out.starts_with("Be concise.\n\n"));
        assert!(out.ends_with(IDENTITY_INSTRUCTION));
    }

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(REWRITES.len(), REWRITE_RULES.len());
    }
}
