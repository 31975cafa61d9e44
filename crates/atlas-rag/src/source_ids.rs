//! doc_id / file_path conventions for KG documents.
//!
//! - Entry doc: `doc_id = entry_uuid`, `file_path = entry_uuid`
//! - Attachment doc: `doc_id = "attachment:<attachment_uuid>"`,
//!   `file_path = "<entry_uuid>/attachments/<attachment_uuid>"`
//!
//! Some recall paths lose the `attachment:` prefix upstream; the
//! parsers here recover linkage from the composite file_path.

use uuid::Uuid;

pub const ATTACHMENT_PREFIX: &str = "attachment:";
const ATTACHMENT_SEGMENT: &str = "/attachments/";

pub fn build_attachment_doc_id(attachment_id: &str) -> String {
    format!("{ATTACHMENT_PREFIX}{attachment_id}")
}

pub fn build_attachment_file_path(entry_id: &str, attachment_id: &str) -> String {
    format!("{entry_id}{ATTACHMENT_SEGMENT}{attachment_id}")
}

pub fn is_attachment_doc_id(doc_id: &str) -> bool {
    doc_id.starts_with(ATTACHMENT_PREFIX)
}

pub fn parse_attachment_id_from_doc_id(doc_id: &str) -> Option<String> {
    let tail = doc_id.strip_prefix(ATTACHMENT_PREFIX)?.trim();
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

fn valid_uuid(raw: &str) -> Option<String> {
    Uuid::parse_str(raw).ok().map(|_| raw.to_string())
}

/// Entry id from a file_path, accepting both the composite format and
/// the legacy bare-UUID format.
pub fn parse_entry_id_from_attachment_file_path(file_path: &str) -> Option<String> {
    let fp = file_path.trim();
    if fp.is_empty() {
        return None;
    }
    if let Some((entry_part, _)) = fp.split_once(ATTACHMENT_SEGMENT) {
        return valid_uuid(entry_part.trim());
    }
    valid_uuid(fp)
}

/// Attachment id from a composite file_path.
pub fn parse_attachment_id_from_attachment_file_path(file_path: &str) -> Option<String> {
    let fp = file_path.trim();
    let (_, tail) = fp.split_once(ATTACHMENT_SEGMENT)?;
    let attachment_part = tail.trim().trim_matches('/').split('/').next()?.trim();
    if attachment_part.is_empty() {
        return None;
    }
    valid_uuid(attachment_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &str = "6f1f3a9a-88f7-4a2e-9d3b-52a5a6a1c000";
    const ATT: &str = "0e0b57f3-0a3a-4a9a-8c5d-9e3f1b2c4d5e";

    #[test]
    fn composite_file_path_round_trips() {
        let fp = build_attachment_file_path(ENTRY, ATT);
        assert_eq!(
            parse_entry_id_from_attachment_file_path(&fp).as_deref(),
            Some(ENTRY)
        );
        assert_eq!(
            parse_attachment_id_from_attachment_file_path(&fp).as_deref(),
            Some(ATT)
        );
    }

    #[test]
    fn legacy_bare_uuid_file_path_still_yields_entry() {
        assert_eq!(
            parse_entry_id_from_attachment_file_path(ENTRY).as_deref(),
            Some(ENTRY)
        );
        assert!(parse_attachment_id_from_attachment_file_path(ENTRY).is_none());
    }

    #[test]
    fn doc_id_prefix_round_trips() {
        let doc_id = build_attachment_doc_id(ATT);
        assert!(is_attachment_doc_id(&doc_id));
        assert_eq!(parse_attachment_id_from_doc_id(&doc_id).as_deref(), Some(ATT));
        assert!(parse_attachment_id_from_doc_id(ENTRY).is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_entry_id_from_attachment_file_path("not-a-uuid/attachments/x").is_none());
        assert!(parse_attachment_id_from_attachment_file_path("a/attachments/").is_none());
        assert!(parse_entry_id_from_attachment_file_path("").is_none());
    }
}
