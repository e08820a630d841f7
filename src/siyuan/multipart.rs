//! Hand-built `multipart/form-data` bodies for the asset upload endpoint.
//!
//! The exact part layout is part of the wire contract with the backend, so it
//! is assembled byte by byte here instead of behind a form library.

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone)]
pub struct MultipartBody {
    boundary: String,
    buf: Vec<u8>,
}

impl Default for MultipartBody {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::with_boundary(format!(
            "----SiyuanMcpBoundary{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            buf: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Append a plain text field.
    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part();
        self.buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_quoted(name)
            )
            .as_bytes(),
        );
        self.buf.extend_from_slice(CRLF);
        self.buf.extend_from_slice(CRLF);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.extend_from_slice(CRLF);
        self
    }

    /// Append a file part.
    pub fn file(mut self, name: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.open_part();
        self.buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"",
                escape_quoted(name),
                escape_quoted(file_name)
            )
            .as_bytes(),
        );
        self.buf.extend_from_slice(CRLF);
        self.buf
            .extend_from_slice(format!("Content-Type: {}", content_type).as_bytes());
        self.buf.extend_from_slice(CRLF);
        self.buf.extend_from_slice(CRLF);
        self.buf.extend_from_slice(bytes);
        self.buf.extend_from_slice(CRLF);
        self
    }

    /// Close the body. Returns `(content_type_header, body_bytes)`.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.buf
            .extend_from_slice(format!("--{}--", self.boundary).as_bytes());
        self.buf.extend_from_slice(CRLF);
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.buf,
        )
    }

    fn open_part(&mut self) {
        self.buf
            .extend_from_slice(format!("--{}", self.boundary).as_bytes());
        self.buf.extend_from_slice(CRLF);
    }
}

/// Header parameter values cannot carry raw quotes or line breaks.
fn escape_quoted(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .map(|c| if c == '"' { "%22".to_string() } else { c.to_string() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_wire_layout() {
        let (content_type, body) = MultipartBody::with_boundary("XyZ")
            .text("assetsDirPath", "/assets/")
            .file("file[]", "a.png", "image/png", b"\x89PNG")
            .finish();

        assert_eq!(content_type, "multipart/form-data; boundary=XyZ");
        let expected: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"assetsDirPath\"\r\n\
\r\n\
/assets/\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"file[]\"; filename=\"a.png\"\r\n\
Content-Type: image/png\r\n\
\r\n\
\x89PNG\r\n\
--XyZ--\r\n";
        assert_eq!(body, expected);
    }

    #[test]
    fn test_filename_quotes_and_newlines_escaped() {
        let (_, body) = MultipartBody::with_boundary("b")
            .file("f", "evil\"\r\nX-Injected: 1.png", "image/png", b"")
            .finish();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("filename=\"evil%22X-Injected: 1.png\""));
        assert!(!text.contains("\r\nX-Injected"));
    }

    #[test]
    fn test_random_boundary_prefix() {
        let body = MultipartBody::new();
        assert!(body.boundary().starts_with("----SiyuanMcpBoundary"));
        assert_ne!(body.boundary(), MultipartBody::new().boundary());
    }
}
