//! Git packet-line encoding.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself.  `0000` is the flush packet that ends a section.
//!
//! Smart HTTP clients expect the `info/refs` advertisement to open with a
//! `# service=<name>` packet followed by a flush, ahead of the refs that
//! `git upload-pack --advertise-refs` prints.

/// The flush packet.
pub const FLUSH: &[u8] = b"0000";

/// Largest payload a single data packet can carry.
pub const MAX_PKT_DATA: usize = 0xFFFF - 4;

/// Encode a byte slice as a Git packet-line (4-hex-digit length prefix + data).
///
/// Callers are responsible for including any trailing newline in `data` if
/// the protocol requires it.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    assert!(
        data.len() <= MAX_PKT_DATA,
        "packet-line data too large ({} bytes)",
        data.len()
    );
    let total_len = data.len() + 4;
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// The header a smart-HTTP `info/refs` response starts with.
pub fn service_announcement(service: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service={service}\n").as_bytes());
    buf.extend_from_slice(FLUSH);
    buf
}

/// Full `info/refs` body: the service announcement followed by the ref
/// advertisement produced by git.
pub fn advertisement(service: &str, refs: &[u8]) -> Vec<u8> {
    let mut buf = service_announcement(service);
    buf.extend_from_slice(refs);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_prefix_length() {
        assert_eq!(encode_pkt_line(b"hello\n"), b"000ahello\n");
        assert_eq!(encode_pkt_line(b""), b"0004");
    }

    #[test]
    fn upload_pack_announcement() {
        assert_eq!(
            service_announcement("git-upload-pack"),
            b"001e# service=git-upload-pack\n0000".to_vec()
        );
    }

    #[test]
    fn advertisement_appends_refs() {
        let refs = b"003fdeadbeef refs/heads/main\n0000";
        let body = advertisement("git-upload-pack", refs);
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
        assert!(body.ends_with(refs));
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn oversized_payload_panics() {
        encode_pkt_line(&vec![b'x'; MAX_PKT_DATA + 1]);
    }
}
