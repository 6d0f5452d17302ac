//! Debugging console for the message-safety pipeline.
//!
//! Reads one message per line from stdin, `user: <text>` or
//! `assistant: <raw reply>`, runs it through the pipeline and prints one JSON
//! decision per line. At EOF prints the merged conversation and the stability
//! report. Exits non-zero when the report fails.

use std::process::ExitCode;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use cbt_safety_lib::models::Message;
use cbt_safety_lib::pipeline::merge::MergeEngine;
use cbt_safety_lib::pipeline::processor::{MessageProcessor, UserTurn};
use cbt_safety_lib::pipeline::stability::StabilityStats;

const CONSOLE_CONVERSATION_ID: &str = "console";

#[tokio::main]
async fn main() -> ExitCode {
    cbt_safety_lib::init_tracing();

    let policy = match cbt_safety_lib::load_policy() {
        Ok((policy, _)) => policy,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load safety policy");
            return ExitCode::FAILURE;
        }
    };

    let processor = MessageProcessor::new(policy.clone());
    let engine = MergeEngine::new(policy);
    let stats = StabilityStats::new();
    let mut conversation: Vec<Message> = Vec::new();
    let mut turn_index = 0u64;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                return ExitCode::FAILURE;
            }
        };
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        let decision = if let Some(text) = line.strip_prefix("user:") {
            let turn = processor
                .process_user_input(Some(CONSOLE_CONVERSATION_ID), text.trim(), turn_index)
                .await;
            let forwarded = turn.should_forward();
            if forwarded {
                conversation = engine.merge(&conversation, &[turn.message().clone()], &stats).messages;
            }
            match turn {
                UserTurn::Crisis {
                    classification,
                    response,
                    ..
                } => json!({
                    "turn": turn_index,
                    "role": "user",
                    "forwarded": false,
                    "classification": classification,
                    "crisis_response": response,
                }),
                UserTurn::Forward { classification, .. } => json!({
                    "turn": turn_index,
                    "role": "user",
                    "forwarded": true,
                    "classification": classification,
                }),
            }
        } else if let Some(raw) = line.strip_prefix("assistant:") {
            let turn = processor.process_assistant_reply(
                Some(CONSOLE_CONVERSATION_ID),
                raw.trim(),
                turn_index,
                &stats,
            );
            let outcome = engine.merge(&conversation, &[turn.message.clone()], &stats);
            conversation = outcome.messages;
            json!({
                "turn": turn_index,
                "role": "assistant",
                "display": turn.message.display_content,
                "metadata": turn.reply_metadata,
                "offer_save": turn.offer_save,
                "rejected": outcome.refetch_required,
            })
        } else {
            json!({ "error": "expected `user: <text>` or `assistant: <text>`", "line": line })
        };

        println!("{decision}");
        turn_index += 1;
    }

    let report = stats.report();
    println!("{}", json!({ "conversation": conversation, "report": report }));
    eprintln!("{report}");

    if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
