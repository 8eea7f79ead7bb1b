/// How a channel prefers long text split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkerMode {
    /// Hard split at the length limit.
    #[default]
    Length,
    /// Prefer breaking at the last newline inside the limit.
    Newline,
}

/// Split `text` into chunks of at most `limit` characters.
pub fn chunk_text(text: &str, limit: usize, mode: ChunkerMode) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest: &str = text;
    while !rest.is_empty() {
        let chars: Vec<(usize, char)> = rest.char_indices().take(limit + 1).collect();
        if chars.len() <= limit {
            chunks.push(rest.to_string());
            break;
        }

        let hard_end = chars[limit].0;
        let window = &rest[..hard_end];
        let cut = match mode {
            ChunkerMode::Length => hard_end,
            ChunkerMode::Newline => match window.rfind('\n') {
                Some(pos) if pos > 0 => pos + 1,
                _ => hard_end,
            },
        };

        chunks.push(rest[..cut].trim_end_matches('\n').to_string());
        rest = &rest[cut..];
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 10, ChunkerMode::Length), vec!["hello"]);
    }

    #[test]
    fn length_mode_splits_hard() {
        let chunks = chunk_text("abcdefghij", 4, ChunkerMode::Length);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn newline_mode_prefers_line_breaks() {
        let chunks = chunk_text("one\ntwo\nthree", 9, ChunkerMode::Newline);
        assert_eq!(chunks, vec!["one\ntwo", "three"]);
    }

    #[test]
    fn zero_limit_means_no_chunking() {
        assert_eq!(
            chunk_text("anything at all", 0, ChunkerMode::Length),
            vec!["anything at all"]
        );
    }
}
