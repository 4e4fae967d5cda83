//! Content tree decoding: bodies, attachments and headers.

use std::collections::BTreeMap;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use super::{Header, MessagePart};
use crate::pipeline::types::Attachment;

/// base64url, padded or not.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoded bodies and attachment references of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedContent {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Decode a base64url body. Invalid UTF-8 is replaced, invalid base64 is `None`.
pub fn decode_body(data: &str) -> Option<String> {
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    match URL_SAFE_LENIENT.decode(cleaned.as_bytes()) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::debug!(error = %e, "Undecodable body part");
            None
        }
    }
}

/// Header map with lowercased names. Later duplicates win.
pub fn parse_headers(headers: &[Header]) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_lowercase(), h.value.clone()))
        .collect()
}

/// Walk the content tree depth-first. Keeps the first text and the first
/// HTML part, and every part that has both a filename and an attachment id.
pub fn walk_parts(root: &MessagePart) -> DecodedContent {
    let mut content = DecodedContent::default();
    visit(root, &mut content);
    content
}

fn visit(part: &MessagePart, content: &mut DecodedContent) {
    let data = part.body.as_ref().and_then(|b| b.data.as_deref());

    match part.mime_type.to_ascii_lowercase().as_str() {
        "text/plain" if content.text.is_none() => content.text = data.and_then(decode_body),
        "text/html" if content.html.is_none() => content.html = data.and_then(decode_body),
        _ => {}
    }

    if let Some(body) = &part.body {
        if let Some(attachment_id) = body.attachment_id.as_deref() {
            if !part.filename.is_empty() && !attachment_id.is_empty() {
                content.attachments.push(Attachment {
                    filename: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                    attachment_id: attachment_id.to_string(),
                    size: body.size,
                });
            }
        }
    }

    for child in &part.parts {
        visit(child, content);
    }
}
