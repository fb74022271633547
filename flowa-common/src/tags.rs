//! Iteration, step and model tags
//!
//! Inversion positions are written as short zero-padded tags:
//! iteration 1 → `i01`, step 0 → `s00`, and the model evaluated during
//! iteration `n` is `m{n-1}` (the starting model is `m00`).

use crate::{Error, Result};

/// Iteration tag, e.g. `i01`
pub fn iter_tag(iteration: u32) -> String {
    format!("i{:02}", iteration)
}

/// Step tag, e.g. `s00`
pub fn step_tag(step_count: u32) -> String {
    format!("s{:02}", step_count)
}

/// Model tag for an iteration, e.g. iteration 1 → `m00`
pub fn model_tag(iteration: u32) -> String {
    format!("m{:02}", iteration.saturating_sub(1))
}

/// Parse the number out of a tag such as `m03` or `s01`
pub fn parse_tag(tag: &str, prefix: char) -> Result<u32> {
    let mut chars = tag.chars();
    if chars.next() != Some(prefix) {
        return Err(Error::InvalidInput(format!(
            "Tag '{}' does not start with '{}'",
            tag, prefix
        )));
    }
    chars
        .as_str()
        .parse::<u32>()
        .map_err(|e| Error::InvalidInput(format!("Tag '{}': {}", tag, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(iter_tag(1), "i01");
        assert_eq!(step_tag(0), "s00");
        assert_eq!(model_tag(1), "m00");
        assert_eq!(model_tag(12), "m11");
        // Iteration 0 never happens, but must not underflow
        assert_eq!(model_tag(0), "m00");
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("m03", 'm').unwrap(), 3);
        assert_eq!(parse_tag("s10", 's').unwrap(), 10);
        assert!(parse_tag("s10", 'm').is_err());
        assert!(parse_tag("mxx", 'm').is_err());
    }
}
