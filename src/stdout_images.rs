//! Image data URIs that user code printed to stdout instead of showing.

use regex::Regex;
use std::sync::LazyLock;

static IMAGE_DATA_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/[a-zA-Z0-9.+-]+;base64,[A-Za-z0-9+/=]+")
        .expect("invalid image data uri regex")
});

static TRAILING_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)[\t ]+$").expect("invalid trailing space regex"));

static BLANK_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("invalid blank run regex"));

/// Stdout split into plain text and the images embedded in it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStdout {
    pub text: String,
    pub images: Vec<String>,
}

/// All image data URIs in `stdout`, in the order they appear
pub fn extract_images(stdout: &str) -> Vec<String> {
    IMAGE_DATA_URI_RE
        .find_iter(stdout)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// `stdout` with image data URIs removed and blank runs collapsed
pub fn strip_images(stdout: &str) -> String {
    let without_images = IMAGE_DATA_URI_RE.replace_all(stdout, "");
    let trimmed = TRAILING_SPACE_RE.replace_all(without_images.trim(), "");
    BLANK_RUN_RE.replace_all(&trimmed, "\n\n").into_owned()
}

pub fn parse_stdout(stdout: &str) -> ParsedStdout {
    ParsedStdout {
        text: strip_images(stdout),
        images: extract_images(stdout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_in_order() {
        let stdout = "first data:image/png;base64,AAAA\nthen data:image/svg+xml;base64,PHN2Zz4=\n";
        assert_eq!(
            extract_images(stdout),
            vec![
                "data:image/png;base64,AAAA".to_string(),
                "data:image/svg+xml;base64,PHN2Zz4=".to_string()
            ]
        );
    }

    #[test]
    fn test_strip_collapses_blank_lines() {
        let stdout = "mean = 2.0   \ndata:image/png;base64,AAAA\n\n\n\nstd = 0.5\n";
        assert_eq!(strip_images(stdout), "mean = 2.0\n\nstd = 0.5");
    }

    #[test]
    fn test_plain_text_untouched() {
        let parsed = parse_stdout("hello\nworld\n");
        assert_eq!(parsed.text, "hello\nworld");
        assert!(parsed.images.is_empty());
    }
}
