use chrono::{Datelike, NaiveDate};

/// Lifecycle of an admission candidature. `Enrolled` is terminal and only
/// ever set by the enrollment transaction; `Refused` is terminal for the
/// decision path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatureStatus {
    Pending,
    InReview,
    Accepted,
    Refused,
    Enrolled,
}

impl CandidatureStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_review" => Some(Self::InReview),
            "accepted" => Some(Self::Accepted),
            "refused" => Some(Self::Refused),
            "enrolled" => Some(Self::Enrolled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InReview => "in_review",
            Self::Accepted => "accepted",
            Self::Refused => "refused",
            Self::Enrolled => "enrolled",
        }
    }

    pub const ALL: [CandidatureStatus; 5] = [
        Self::Pending,
        Self::InReview,
        Self::Accepted,
        Self::Refused,
        Self::Enrolled,
    ];
}

/// Intake priority. Affects list ordering only, never transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Urgent,
    VeryUrgent,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "urgent" => Some(Self::Urgent),
            "very_urgent" => Some(Self::VeryUrgent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
            Self::VeryUrgent => "very_urgent",
        }
    }

    pub const ALL: [Priority; 3] = [Self::Normal, Self::Urgent, Self::VeryUrgent];
}

/// Evaluator's suggested outcome, distinct from the authoritative status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Accept,
    Refuse,
    Wait,
}

impl Recommendation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Self::Accept),
            "refuse" => Some(Self::Refuse),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Refuse => "refuse",
            Self::Wait => "wait",
        }
    }
}

/// The five tracked document slots. The first four are "primary" and drive
/// the derived global status; `Other` is tracked but never counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    BirthCertificate,
    ReportCard,
    MedicalCertificate,
    IdPhoto,
    Other,
}

impl DocumentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "birth_certificate" => Some(Self::BirthCertificate),
            "report_card" => Some(Self::ReportCard),
            "medical_certificate" => Some(Self::MedicalCertificate),
            "id_photo" => Some(Self::IdPhoto),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BirthCertificate => "birth_certificate",
            Self::ReportCard => "report_card",
            Self::MedicalCertificate => "medical_certificate",
            Self::IdPhoto => "id_photo",
            Self::Other => "other",
        }
    }

    pub const ALL: [DocumentKind; 5] = [
        Self::BirthCertificate,
        Self::ReportCard,
        Self::MedicalCertificate,
        Self::IdPhoto,
        Self::Other,
    ];

    pub const PRIMARY: [DocumentKind; 4] = [
        Self::BirthCertificate,
        Self::ReportCard,
        Self::MedicalCertificate,
        Self::IdPhoto,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    NotProvided,
    Provided,
    Verified,
    Rejected,
}

impl DocumentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_provided" => Some(Self::NotProvided),
            "provided" => Some(Self::Provided),
            "verified" => Some(Self::Verified),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotProvided => "not_provided",
            Self::Provided => "provided",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }
}

/// Derived at read time, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalDocumentStatus {
    Complete,
    Incomplete,
    Rejected,
}

impl GlobalDocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
            Self::Rejected => "rejected",
        }
    }
}

/// Global document status over the four primary slots: all `verified` =>
/// complete, any `rejected` => rejected, anything else => incomplete.
/// Slots without a stored row count as `not_provided`; `other` is ignored.
pub fn global_document_status(slots: &[(DocumentKind, DocumentStatus)]) -> GlobalDocumentStatus {
    let mut verified = 0usize;
    for kind in DocumentKind::PRIMARY {
        let status = slots
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| *s)
            .unwrap_or(DocumentStatus::NotProvided);
        match status {
            DocumentStatus::Rejected => return GlobalDocumentStatus::Rejected,
            DocumentStatus::Verified => verified += 1,
            _ => {}
        }
    }
    if verified == DocumentKind::PRIMARY.len() {
        GlobalDocumentStatus::Complete
    } else {
        GlobalDocumentStatus::Incomplete
    }
}

/// Evaluation scores are on the Congolese 0..=20 scale.
pub const SCORE_MAX: f64 = 20.0;

pub fn validate_score(score: f64) -> Result<(), String> {
    if !score.is_finite() || score < 0.0 || score > SCORE_MAX {
        return Err(format!("score must be between 0 and {}", SCORE_MAX));
    }
    Ok(())
}

pub fn validate_fee(fee: f64, key: &str) -> Result<(), String> {
    if !fee.is_finite() || fee < 0.0 {
        return Err(format!("{} must be >= 0", key));
    }
    Ok(())
}

pub fn validate_discount_pct(pct: f64) -> Result<(), String> {
    if !pct.is_finite() || pct < 0.0 || pct > 100.0 {
        return Err("discountPct must be between 0 and 100".to_string());
    }
    Ok(())
}

/// Fee record total: `(registration + tuition) * (1 - discount/100)`.
pub fn fee_total(registration_fee: f64, tuition_fee: f64, discount_pct: f64) -> f64 {
    (registration_fee + tuition_fee) * (1.0 - discount_pct / 100.0)
}

/// Student matricule: `<year><4-digit zero-padded sequence>`, e.g. 20260001.
pub fn format_matricule(year: i32, seq: i64) -> String {
    format!("{}{:04}", year, seq)
}

/// Trailing sequence of a matricule for the given year, if it has that
/// year's prefix and a numeric suffix. Used to seed counters from data
/// created before the counter table existed.
pub fn matricule_seq(matricule: &str, year: i32) -> Option<i64> {
    let rest = matricule.strip_prefix(&year.to_string())?;
    if rest.is_empty() {
        return None;
    }
    rest.parse::<i64>().ok().filter(|n| *n > 0)
}

/// Candidature request number: `ADM-<year>-<4-digit sequence>`.
pub fn format_request_no(year: i32, seq: i64) -> String {
    format!("ADM-{}-{:04}", year, seq)
}

pub fn request_no_seq(request_no: &str, year: i32) -> Option<i64> {
    let rest = request_no.strip_prefix(&format!("ADM-{}-", year))?;
    rest.parse::<i64>().ok().filter(|n| *n > 0)
}

/// Academic year containing `date`. DRC school years run September through
/// July, so September onward belongs to the year starting that September.
pub fn academic_year_for(date: NaiveDate) -> String {
    let y = date.year();
    if date.month() >= 9 {
        format!("{}-{}", y, y + 1)
    } else {
        format!("{}-{}", y - 1, y)
    }
}
