//! Bank notification parser.
//!
//! Dispatch is an ordered route list evaluated until the first extractor
//! returns a result:
//!
//! 1. peer-payment marker in the subject or body → peer-payment extractor
//! 2. sender matches a known bank → that bank's extractor
//! 3. peer-payment extractor as the catch-all
//!
//! Parse misses are data: callers get `None`, never an error.

pub mod dates;
pub mod extractors;
pub mod normalize;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use dates::{DateFormat, NormalizedDate, normalize_date};
pub use extractors::{BankExtractor, Extraction, UNMATCHED};
pub use normalize::{html_to_text, normalize_text};

/// Default description when nothing better is known.
pub const DEFAULT_DESCRIPTION: &str = "Transacción";

/// Marker identifying peer-payment notifications.
const PEER_PAYMENT_MARKER: &str = "yape";

/// Fields extracted from one notification. Unmatched text fields hold
/// [`UNMATCHED`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub bank: String,
    pub amount: String,
    pub currency: String,
    /// Date text as printed in the notification.
    pub operation_date: String,
    /// `YYYY-MM-DDTHH:MM:SS` when the date text was recognized.
    #[serde(default)]
    pub normalized_date: Option<String>,
    pub payer: String,
    pub origin_account: String,
    pub beneficiary_name: String,
    pub beneficiary_account: String,
    pub beneficiary_phone: String,
    pub operation_number: String,
    pub operation_type: String,
    pub commission: String,
    /// Last digits of the card or account, when the bank prints them.
    #[serde(default)]
    pub account_hint: Option<String>,
    /// The message subject.
    pub description: String,
    pub raw_text: String,
}

impl ParsedTransaction {
    pub(crate) fn new(bank: &str, subject: &str, raw_text: &str) -> Self {
        let unmatched = || UNMATCHED.to_string();
        Self {
            bank: bank.to_string(),
            amount: unmatched(),
            currency: "PEN".to_string(),
            operation_date: unmatched(),
            normalized_date: None,
            payer: unmatched(),
            origin_account: unmatched(),
            beneficiary_name: unmatched(),
            beneficiary_account: unmatched(),
            beneficiary_phone: unmatched(),
            operation_number: unmatched(),
            operation_type: unmatched(),
            commission: unmatched(),
            account_hint: None,
            description: subject.to_string(),
            raw_text: raw_text.to_string(),
        }
    }
}

/// `None` for the unmatched sentinel and blank values.
pub fn known(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value == UNMATCHED {
        None
    } else {
        Some(value)
    }
}

/// Human description: subject, payer, beneficiary and operation type joined
/// with `" | "`.
pub fn build_description(tx: &ParsedTransaction) -> String {
    let mut parts = Vec::new();
    if let Some(subject) = known(&tx.description) {
        parts.push(subject.to_string());
    }
    if let Some(payer) = known(&tx.payer) {
        parts.push(format!("De: {payer}"));
    }
    if let Some(beneficiary) = known(&tx.beneficiary_name) {
        parts.push(format!("Para: {beneficiary}"));
    }
    if let Some(kind) = known(&tx.operation_type) {
        parts.push(kind.to_string());
    }

    if parts.is_empty() {
        DEFAULT_DESCRIPTION.to_string()
    } else {
        parts.join(" | ")
    }
}

/// When a route applies.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// Marker appears in the subject or body.
    Marker(&'static str),
    /// Sender contains this fragment.
    Sender(&'static str),
    Always,
}

const ROUTES: &[(Trigger, BankExtractor)] = &[
    (Trigger::Marker(PEER_PAYMENT_MARKER), BankExtractor::PeerPayment),
    (Trigger::Sender("interbank"), BankExtractor::Interbank),
    (Trigger::Sender("bcp"), BankExtractor::Bcp),
    (Trigger::Sender("bbva"), BankExtractor::Bbva),
    (Trigger::Sender("scotiabank"), BankExtractor::Scotiabank),
    (Trigger::Always, BankExtractor::PeerPayment),
];

/// Extractors applicable to a message, in priority order, without repeats.
pub fn candidates(text: &str, subject: &str, from: &str) -> Vec<BankExtractor> {
    let text = text.to_lowercase();
    let subject = subject.to_lowercase();
    let from = from.to_lowercase();

    let mut out = Vec::new();
    for (trigger, extractor) in ROUTES {
        let applies = match trigger {
            Trigger::Marker(marker) => subject.contains(marker) || text.contains(marker),
            Trigger::Sender(fragment) => from.contains(fragment),
            Trigger::Always => true,
        };
        if applies && !out.contains(extractor) {
            out.push(*extractor);
        }
    }
    out
}

/// Parse already-extracted plain text.
pub fn parse_text(body: &str, subject: &str, from: &str) -> Option<ParsedTransaction> {
    let text = normalize_text(body);
    if text.is_empty() {
        return None;
    }

    for extractor in candidates(&text, subject, from) {
        match extractor.extract(&text, subject) {
            Extraction::Success(mut tx) => {
                tx.normalized_date = known(&tx.operation_date)
                    .and_then(|raw| normalize_date(raw).parsed())
                    .map(|dt| NormalizedDate::Parsed(dt).to_storage_string());
                debug!(extractor = extractor.name(), bank = %tx.bank, "Notification parsed");
                return Some(tx);
            }
            Extraction::NotApplicable => {
                debug!(extractor = extractor.name(), "Extractor not applicable");
            }
        }
    }
    None
}

/// Parse a message, preferring the text part and falling back to the HTML
/// part converted to text.
pub fn parse_email(
    text_body: Option<&str>,
    html_body: Option<&str>,
    subject: &str,
    from: &str,
) -> Option<ParsedTransaction> {
    if let Some(tx) = text_body.and_then(|body| parse_text(body, subject, from)) {
        return Some(tx);
    }
    html_body.and_then(|html| parse_text(&html_to_text(html), subject, from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_payment_scenario() {
        let body = "Te enviaron S/ 120.50 N° de operación: 123456";
        let tx = parse_email(
            Some(body),
            None,
            "Yape: constancia de pago",
            "notificaciones@yape.pe",
        )
        .unwrap();
        assert_eq!(tx.amount, "120.50");
        assert_eq!(tx.operation_number, "123456");
        assert_eq!(tx.bank, "BCP/YaPe");
    }

    #[test]
    fn marker_beats_sender_bank() {
        let body = "Monto: S/ 45.00 Fecha: 02/03/2024 Cuenta ****1234";
        let from = "BCP <notificaciones@notificacionesbcp.com.pe>";

        let tx = parse_text(body, "Constancia Yape", from).unwrap();
        assert_eq!(tx.bank, "BCP/YaPe");

        let tx = parse_text(body, "Consumo con tarjeta", from).unwrap();
        assert_eq!(tx.bank, "BCP");
        assert_eq!(tx.account_hint.as_deref(), Some("1234"));
    }

    #[test]
    fn candidate_order_and_dedup() {
        assert_eq!(
            candidates("pago yape", "x", "alertas@bbva.pe"),
            vec![BankExtractor::PeerPayment, BankExtractor::Bbva]
        );
        assert_eq!(
            candidates("texto", "x", "alertas@bbva.pe"),
            vec![BankExtractor::Bbva, BankExtractor::PeerPayment]
        );
        assert_eq!(
            candidates("texto", "x", "otro@banco.pe"),
            vec![BankExtractor::PeerPayment]
        );
    }

    #[test]
    fn falls_through_to_next_candidate() {
        // Scotiabank needs two decimals; the catch-all still reads the amount.
        let tx = parse_text("Cargo de S/ 15", "Aviso", "alertas@scotiabank.com.pe").unwrap();
        assert_eq!(tx.bank, "BCP/YaPe");
        assert_eq!(tx.amount, "15");
    }

    #[test]
    fn html_fallback_when_text_has_no_amount() {
        let html = "<p>Hola <b>Ana</b>,</p><p>Monto: S/ 30.00</p><p>Fecha: 2024-12-15 10:30</p>";
        let tx = parse_email(Some("Gracias por usar Yape"), Some(html), "Yape", "x@yape.pe").unwrap();
        assert_eq!(tx.amount, "30.00");
        assert_eq!(tx.normalized_date.as_deref(), Some("2024-12-15T10:30:00"));
    }

    #[test]
    fn nothing_to_parse() {
        assert_eq!(parse_email(None, None, "s", "f"), None);
        assert_eq!(parse_email(Some("Hola, sin montos"), None, "s", "f"), None);
    }

    #[test]
    fn description_parts() {
        let mut tx = ParsedTransaction::new("BCP/YaPe", "Constancia", "");
        assert_eq!(build_description(&tx), "Constancia");
        tx.payer = "Ana".into();
        tx.beneficiary_name = "Luis".into();
        tx.operation_type = "Transferencia".into();
        assert_eq!(
            build_description(&tx),
            "Constancia | De: Ana | Para: Luis | Transferencia"
        );
        let empty = ParsedTransaction::new("BCP", "", "");
        assert_eq!(build_description(&empty), DEFAULT_DESCRIPTION);
    }
}
