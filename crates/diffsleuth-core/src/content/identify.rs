//! File type identification from leading magic bytes.
//!
//! Produces a short human-readable description (in the spirit of `file(1)`)
//! for the first bytes of a file. Only the head of the stream is inspected,
//! so identification costs nothing beyond the read the digest already does.

/// Number of leading bytes handed to an identifier.
pub const IDENTIFY_HEAD_SIZE: usize = 4096;

/// Maps the head of a byte stream to a type description.
pub trait TypeIdentifier: Send + Sync {
    /// `head` holds up to [`IDENTIFY_HEAD_SIZE`] leading bytes (fewer for
    /// short files). Returns `None` if the identifier declines to answer.
    fn identify(&self, head: &[u8]) -> Option<String>;
}

/// Signature-table identifier covering the formats that matter most in a
/// before/after disk comparison: executables, archives, documents, images
/// and registry hives.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicIdentifier;

/// `(offset, magic, description)` -- first match wins.
const SIGNATURES: &[(usize, &[u8], &str)] = &[
    (0, b"regf", "MS Windows registry file"),
    (0, b"MZ", "PE32 executable (MS Windows)"),
    (0, b"\x7fELF", "ELF executable"),
    (0, b"#!", "script text executable"),
    (0, b"PK\x03\x04", "Zip archive data"),
    (0, b"PK\x05\x06", "Zip archive data (empty)"),
    (0, b"Rar!\x1a\x07", "RAR archive data"),
    (0, b"7z\xbc\xaf\x27\x1c", "7-zip archive data"),
    (0, b"\x1f\x8b", "gzip compressed data"),
    (0, b"BZh", "bzip2 compressed data"),
    (0, b"\xfd7zXZ\x00", "XZ compressed data"),
    (0, b"\x28\xb5\x2f\xfd", "Zstandard compressed data"),
    (0, b"MSCF", "Microsoft Cabinet archive data"),
    (257, b"ustar", "POSIX tar archive"),
    (0, b"%PDF-", "PDF document"),
    (0, b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1", "Composite Document File V2 Document"),
    (0, b"{\\rtf", "Rich Text Format data"),
    (0, b"\x89PNG\r\n\x1a\n", "PNG image data"),
    (0, b"\xff\xd8\xff", "JPEG image data"),
    (0, b"GIF87a", "GIF image data"),
    (0, b"GIF89a", "GIF image data"),
    (0, b"BM", "PC bitmap"),
    (0, b"ElfFile\x00", "MS Windows Vista Event Log"),
    (0, b"LfLe", "MS Windows Event Log"),
    (0, b"SQLite format 3\x00", "SQLite 3.x database"),
    (0, b"L\x00\x00\x00\x01\x14\x02\x00", "MS Windows shortcut"),
    (0, b"\xca\xfe\xba\xbe", "Mach-O universal binary"),
    (0, b"\xcf\xfa\xed\xfe", "Mach-O 64-bit executable"),
];

impl TypeIdentifier for MagicIdentifier {
    fn identify(&self, head: &[u8]) -> Option<String> {
        if head.is_empty() {
            return Some("empty".to_string());
        }

        for &(offset, magic, description) in SIGNATURES {
            if head.len() >= offset + magic.len() && &head[offset..offset + magic.len()] == magic {
                return Some(description.to_string());
            }
        }

        Some(classify_text(head).to_string())
    }
}

/// Fallback for data without a known signature.
fn classify_text(head: &[u8]) -> &'static str {
    if head.starts_with(b"\xef\xbb\xbf") {
        return "UTF-8 Unicode (with BOM) text";
    }
    if head.starts_with(b"\xff\xfe") || head.starts_with(b"\xfe\xff") {
        return "UTF-16 Unicode text";
    }
    let printable = head
        .iter()
        .all(|&b| b.is_ascii_graphic() || b.is_ascii_whitespace());
    if printable {
        return "ASCII text";
    }
    if std::str::from_utf8(head).is_ok() {
        return "UTF-8 Unicode text";
    }
    "data"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(bytes: &[u8]) -> String {
        MagicIdentifier.identify(bytes).unwrap()
    }

    #[test]
    fn identifies_executables() {
        assert_eq!(id(b"MZ\x90\x00\x03"), "PE32 executable (MS Windows)");
        assert_eq!(id(b"\x7fELF\x02\x01"), "ELF executable");
    }

    #[test]
    fn identifies_registry_hive() {
        assert_eq!(id(b"regf\x01\x00\x00\x00"), "MS Windows registry file");
    }

    #[test]
    fn identifies_tar_at_offset() {
        let mut head = vec![0u8; 512];
        head[257..262].copy_from_slice(b"ustar");
        assert_eq!(id(&head), "POSIX tar archive");
    }

    #[test]
    fn short_head_does_not_match_longer_magic() {
        // "PK" alone is too short for either zip signature.
        assert_eq!(id(b"PK"), "ASCII text");
    }

    #[test]
    fn text_and_data_fallbacks() {
        assert_eq!(id(b"hello world\n"), "ASCII text");
        assert_eq!(id("héllo".as_bytes()), "UTF-8 Unicode text");
        assert_eq!(id(&[0x00, 0x9f, 0x92, 0x96]), "data");
        assert_eq!(id(b""), "empty");
    }
}
