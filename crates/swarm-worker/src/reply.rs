//! Final reply cleanup

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const RESPONSE_MARKER: &str = "\r\n\r\nResponse: ";
const FENCE: &str = "```";

/// Strip reasoning delimiters and code fences from a full model reply.
/// The end of a reasoning section becomes a section break followed by `Response: `.
pub fn clean_reply(raw: &str) -> String {
    raw.replace(THINK_OPEN, "")
        .replace(THINK_CLOSE, RESPONSE_MARKER)
        .replace(FENCE, "")
}
