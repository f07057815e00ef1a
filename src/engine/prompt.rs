// src/engine/prompt.rs
//! System prompt construction

use crate::engine::config::ProcessorKind;
use crate::engine::tools::ToolSpec;
use std::fmt::Write;

const PREAMBLE: &str = "You are a browsing assistant that answers the user's request by reasoning \
step by step and calling tools when you need information or need to act.";

/// Render the system prompt for a run
pub fn system_prompt(processor: ProcessorKind, tools: &[ToolSpec], max_tool_calls: usize) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(PREAMBLE);
    prompt.push_str("\n\n## Output format\n\n");
    prompt.push_str(
        "Every reply must use these tags and nothing else outside them:\n\
         <thought>your reasoning</thought>\n\
         <tool_call>{\"id\": \"call_001\", \"name\": \"tool_name\", \"arguments\": {}}</tool_call>\n\
         <response>the final answer for the user</response>\n\n\
         Tool results come back as <observation id=\"...\"> blocks. \
         Each tool call id must be new; never reuse an id. \
         Do not write a <response> in the same reply as a <tool_call>.\n",
    );

    match processor {
        ProcessorKind::React => {
            prompt.push_str("\nCall at most one tool per reply, then wait for its observation.\n");
        }
        ProcessorKind::Coact => {
            let _ = writeln!(
                prompt,
                "\nYou may call up to {max_tool_calls} independent tools in one reply; \
                 they run together and all observations arrive before your next reply."
            );
        }
    }

    prompt.push_str("\n## Tools\n\n");
    if tools.is_empty() {
        prompt.push_str("No tools are available. Answer from your own knowledge.\n");
    } else {
        for tool in tools {
            let _ = writeln!(prompt, "### {}", tool.name);
            if !tool.description.is_empty() {
                let _ = writeln!(prompt, "{}", tool.description);
            }
            let _ = writeln!(prompt, "Parameters: {}\n", tool.input_schema);
        }
    }

    prompt
}
