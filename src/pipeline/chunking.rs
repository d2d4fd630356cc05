//! Splitting extracted text into overlapping windows

/// Splits `text` into windows of `chunk_size` characters where consecutive
/// windows share `overlap` characters
///
/// Windows end on whitespace when one is available in their second half, so
/// words are rarely cut. Whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(chunk_size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            let floor = start + chunk_size / 2;
            (floor..hard_end)
                .rev()
                .find(|&i| chars[i].is_whitespace())
                .unwrap_or(hard_end)
        };

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end == chars.len() {
            break;
        }
        start = (end.saturating_sub(overlap)).max(start + 1);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        assert_eq!(chunk_text("  hello world ", 100, 10), vec!["hello world"]);
        assert!(chunk_text("   ", 100, 10).is_empty());
    }

    #[test]
    fn test_windows_overlap() {
        let text = "a".repeat(25);
        let chunks = chunk_text(&text, 10, 4);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        // 0..10, 6..16, 12..22, 18..25
        assert_eq!(chunks[3].len(), 7);
    }

    #[test]
    fn test_prefers_word_boundaries() {
        let chunks = chunk_text("alpha beta gamma delta", 12, 0);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn test_multibyte_text() {
        let chunks = chunk_text("héllo wörld ünïcode", 8, 2);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 8));
    }
}
