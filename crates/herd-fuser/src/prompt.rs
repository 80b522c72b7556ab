use herd_core::{AnalysisSnapshot, ConversationTurn, TurnDirection};
use std::fmt::Write as _;

const ASSISTANT_ROLE: &str =
    "You are an AI assistant helping a farmer monitor their cows through a video analysis system.";

const REPLY_GUIDANCE: &str = "Give helpful, practical farming advice based on the current cow \
monitoring situation and the farmer's message. Mention any concerning patterns in the analysis. \
Keep the reply short, precise and actionable.";

/// Builds the single prompt sent to the oracle for one farmer message.
///
/// Holds the snapshot status, its timestamp and sample index, the analysis
/// text, prior turns oldest first, and the utterance exactly as received.
pub fn compose_prompt(
    snapshot: &AnalysisSnapshot,
    history: &[ConversationTurn],
    utterance: &str,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "{ASSISTANT_ROLE}");
    prompt.push('\n');
    let _ = writeln!(prompt, "Current Analysis Status: {}", snapshot.status);
    let _ = writeln!(
        prompt,
        "Latest Analysis (at {}): {}",
        snapshot.timestamp.to_rfc3339(),
        snapshot.analysis
    );
    let _ = writeln!(prompt, "Frame Count: {}", snapshot.sample_index);

    if !history.is_empty() {
        prompt.push('\n');
        let _ = writeln!(prompt, "Recent conversation:");
        for turn in history {
            let speaker = match turn.direction {
                TurnDirection::Inbound => "Farmer",
                TurnDirection::Outbound => "Assistant",
            };
            let _ = writeln!(prompt, "{speaker}: {}", turn.text);
        }
    }

    prompt.push('\n');
    let _ = writeln!(prompt, "Farmer's Message: {utterance}");
    prompt.push('\n');
    prompt.push_str(REPLY_GUIDANCE);
    prompt
}
