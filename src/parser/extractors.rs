//! Per-bank field extractors.
//!
//! Every extractor works on normalized single-line text and is pure: each
//! field has an ordered list of candidate patterns, the first capture wins,
//! and a field nothing matched is left as [`UNMATCHED`]. A result without an
//! amount is [`Extraction::NotApplicable`].

use std::sync::LazyLock;

use regex::Regex;

use super::ParsedTransaction;

/// Sentinel for a field no pattern matched.
pub const UNMATCHED: &str = "-";

/// Outcome of running one extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Success(ParsedTransaction),
    NotApplicable,
}

/// First non-empty capture among `patterns`, trimmed, or [`UNMATCHED`].
pub fn extract(body: &str, patterns: &[Regex]) -> String {
    patterns
        .iter()
        .filter_map(|p| p.captures(body))
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| UNMATCHED.to_string())
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
}

fn strip_spaces(value: String) -> String {
    if value == UNMATCHED {
        return value;
    }
    let stripped: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() {
        UNMATCHED.to_string()
    } else {
        stripped
    }
}

/// Amounts captured with `[\d,.]+` can swallow sentence punctuation.
fn clean_amount(value: String) -> String {
    value.trim_end_matches(['.', ',']).to_string()
}

// ── Peer payment (Yape) ─────────────────────────────────────────────

const NAME: &str = r"([A-Za-zÁÉÍÓÚÑáéíóúñ ]+)";

static YAPE_AMOUNT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Monto(?:\s+Total)?:?\s*S/\s*([\d,.]+)",
        r"(?i)Total del consumo:?\s*S/\s*([\d,.]+)",
        r"(?i)S/\s*([\d,.]+)\s*(?:PEN)?",
    ])
});
static YAPE_OPERATION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)N(?:ú|u)mero de operación:?\s*(\d+)",
        r"(?i)N° de operación:?\s*(\d+)",
        r"(?i)Nº de operación:?\s*(\d+)",
        r"(?i)Código de operación:?\s*(\d+)",
        r"(?i)\bOperación[:\s]+(\d{5,})",
    ])
});
static YAPE_DATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(\d{1,2}\s+(?:enero|febrero|marzo|abril|mayo|junio|julio|agosto|septiembre|setiembre|octubre|noviembre|diciembre)\s+\d{4}\s*-\s*\d{1,2}:\d{2}\s*(?:a\.?m\.?|p\.?m\.?))",
        r"(?i)\bFecha(?:\s+y\s+hora)?:?\s*(.+)",
        r"(?i)(\d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}\s*(?:AM|PM))",
        r"(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2})",
    ])
});
static YAPE_PAYER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        format!(r"(?i)Hola[,\s]+{NAME}").as_str(),
        format!(r"(?i)De:\s*{NAME}").as_str(),
        format!(r"(?i)Titular:?\s*{NAME}").as_str(),
    ])
});
static YAPE_ORIGIN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Cuenta cargo:?\s*([\d\s]+)",
        r"(?i)Desde el número:?\s*(\d{6,})",
        r"(?i)Tu número de celular:?\s*(\d{6,})",
        r"(?i)Cuenta origen:?\s*([\d\s]{6,})",
    ])
});
static YAPE_BENEFICIARY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Nombre del Beneficiario:?\s*(.+)",
        r"(?i)Enviado a:?\s*(.+)",
        r"(?i)Beneficiario:?\s*(.+)",
        format!(r"(?i)Para:?\s*{NAME}").as_str(),
    ])
});
static YAPE_BENEFICIARY_ACCOUNT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Cuenta destino:?\s*([\d\s]+)",
        r"(?i)Celular del Beneficiario:?\s*(\d{6,})",
        r"(?i)Nro destino:?\s*(\d{6,})",
    ])
});
static YAPE_PHONE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)celular del beneficiario[:\s]*([x\d]{6,})",
        r"(?i)celular[:\s]*([x\d]{6,})",
        r"(?i)destinatario[:\s]*([x\d]{6,})",
        r"(?i)cuenta destino[:\s]*([x\d]{6,})",
    ])
});

fn peer_payment(text: &str, subject: &str) -> Extraction {
    let amount = clean_amount(extract(text, &YAPE_AMOUNT));
    if amount == UNMATCHED || amount.is_empty() {
        return Extraction::NotApplicable;
    }

    let mut tx = ParsedTransaction::new("BCP/YaPe", subject, text);
    tx.amount = amount;
    tx.operation_number = extract(text, &YAPE_OPERATION);
    tx.operation_date = extract(text, &YAPE_DATE);
    tx.payer = extract(text, &YAPE_PAYER);
    tx.origin_account = strip_spaces(extract(text, &YAPE_ORIGIN));
    tx.beneficiary_name = extract(text, &YAPE_BENEFICIARY);
    tx.beneficiary_account = strip_spaces(extract(text, &YAPE_BENEFICIARY_ACCOUNT));
    tx.beneficiary_phone = extract(text, &YAPE_PHONE);
    Extraction::Success(tx)
}

// ── Interbank ───────────────────────────────────────────────────────

static IBK_AMOUNT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Monto Total:\s*S/\s*([\d,.]+)",
        r"(?i)Monto:?\s*S/\s*([\d,.]+)",
    ])
});
static IBK_PAYER: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"(?i)Hola\s+([^\n,]+)"]));
static IBK_ORIGIN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Cuenta cargo:\s*Cuenta Simple Soles\s*([\d\s]+)",
        r"(?i)Cuenta cargo:\s*([\d\s]+)",
    ])
});
static IBK_DATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(\d{2}\s\w{3}\s\d{4}\s\d{2}:\d{2}\s[AP]M)",
        r"(?i)Fecha:?\s*(.+)",
    ])
});
static IBK_BENEFICIARY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Cuenta destino:\s*([^\n\d]+)",
        r"(?i)Beneficiario:\s*([^\n]+)",
    ])
});
static IBK_BENEFICIARY_ACCOUNT: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"(?i)Cuenta destino:[^\d]*([\d\s]+)"]));
static IBK_OPERATION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)Código de operación:\s*(\d+)",
        r"(?i)Nro de operación:\s*(\d+)",
    ])
});
static IBK_TYPE: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"(?i)Tipo de operación:\s*([^\n]+)"]));
static IBK_COMMISSION: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"(?i)Comisión:\s*S/\s*([\d,.]+)"]));

fn interbank(text: &str, subject: &str) -> Extraction {
    let amount = clean_amount(extract(text, &IBK_AMOUNT));
    if amount == UNMATCHED || amount.is_empty() {
        return Extraction::NotApplicable;
    }

    let mut tx = ParsedTransaction::new("Interbank", subject, text);
    tx.amount = amount;
    tx.payer = extract(text, &IBK_PAYER);
    tx.origin_account = strip_spaces(extract(text, &IBK_ORIGIN));
    tx.operation_date = extract(text, &IBK_DATE);
    tx.beneficiary_name = extract(text, &IBK_BENEFICIARY);
    tx.beneficiary_account = strip_spaces(extract(text, &IBK_BENEFICIARY_ACCOUNT));
    tx.operation_number = extract(text, &IBK_OPERATION);
    tx.operation_type = extract(text, &IBK_TYPE);
    tx.commission = clean_amount(extract(text, &IBK_COMMISSION));
    Extraction::Success(tx)
}

// ── Card-style banks ────────────────────────────────────────────────

static BCP_WITH_ACCOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)monto:\s*s/\s*([\d,]+\.\d{2}).*?fecha:\s*(\d{2}/\d{2}/\d{4}).*?cuenta.*?(\d{4})")
        .expect("static regex")
});
static BCP_SIMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)monto:\s*s/\s*([\d,]+\.\d{2}).*?fecha:\s*(\d{2}/\d{2}/\d{4})")
        .expect("static regex")
});
static BBVA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)importe.*?s/\s*([\d,]+\.\d{2}).*?(\d{2}/\d{2}/\d{4})").expect("static regex")
});
static SCOTIABANK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)s/\s*([\d,]+\.\d{2})").expect("static regex"));

fn card_style(
    bank: &str,
    subject: &str,
    caps: Option<regex::Captures<'_>>,
    date_group: Option<usize>,
    hint_group: Option<usize>,
) -> Extraction {
    let Some(caps) = caps else {
        return Extraction::NotApplicable;
    };
    let group = |i: Option<usize>| {
        i.and_then(|i| caps.get(i))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| UNMATCHED.to_string())
    };

    let raw = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
    let mut tx = ParsedTransaction::new(bank, subject, raw);
    tx.amount = group(Some(1)).replace(',', "");
    tx.operation_date = group(date_group);
    tx.account_hint = hint_group.map(|i| group(Some(i)));
    Extraction::Success(tx)
}

fn bcp(text: &str, subject: &str) -> Extraction {
    match BCP_WITH_ACCOUNT.captures(text) {
        Some(caps) => card_style("BCP", subject, Some(caps), Some(2), Some(3)),
        None => card_style("BCP", subject, BCP_SIMPLE.captures(text), Some(2), None),
    }
}

fn bbva(text: &str, subject: &str) -> Extraction {
    card_style("BBVA", subject, BBVA.captures(text), Some(2), None)
}

fn scotiabank(text: &str, subject: &str) -> Extraction {
    card_style("Scotiabank", subject, SCOTIABANK.captures(text), None, None)
}

// ── Dispatch ────────────────────────────────────────────────────────

/// The known extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankExtractor {
    PeerPayment,
    Interbank,
    Bcp,
    Bbva,
    Scotiabank,
}

impl BankExtractor {
    pub fn name(&self) -> &'static str {
        match self {
            BankExtractor::PeerPayment => "peer_payment",
            BankExtractor::Interbank => "interbank",
            BankExtractor::Bcp => "bcp",
            BankExtractor::Bbva => "bbva",
            BankExtractor::Scotiabank => "scotiabank",
        }
    }

    /// Run against normalized text.
    pub fn extract(&self, text: &str, subject: &str) -> Extraction {
        match self {
            BankExtractor::PeerPayment => peer_payment(text, subject),
            BankExtractor::Interbank => interbank(text, subject),
            BankExtractor::Bcp => bcp(text, subject),
            BankExtractor::Bbva => bbva(text, subject),
            BankExtractor::Scotiabank => scotiabank(text, subject),
        }
    }
}
