//! Field names and value parsing for the identity sheet.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::workbook::CellValue;

/// A recognised key of the identity sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKey {
    PeriodFrom,
    PeriodTill,
    Net,
    Invoice,
    Tax,
    DocType,
    FullName,
    Created,
    Currency,
    PartnerId,
}

impl FieldKey {
    pub const REQUIRED: [FieldKey; 5] = [
        FieldKey::PeriodFrom,
        FieldKey::PeriodTill,
        FieldKey::Net,
        FieldKey::Invoice,
        FieldKey::Tax,
    ];

    /// Match a sheet key, ignoring case and surrounding whitespace
    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_lowercase();
        let field = match key.as_str() {
            "period from" | "period start" => FieldKey::PeriodFrom,
            "period till" | "period to" | "period end" => FieldKey::PeriodTill,
            "net" => FieldKey::Net,
            "invoice" | "payable" => FieldKey::Invoice,
            "tax" => FieldKey::Tax,
            "doctype" | "doc type" | "type" => FieldKey::DocType,
            "full name" | "fullname" => FieldKey::FullName,
            "created" => FieldKey::Created,
            // "curreny" shows up in real uploads
            "currency" | "curreny" => FieldKey::Currency,
            "inc" | "partner id" => FieldKey::PartnerId,
            _ => return None,
        };
        Some(field)
    }

    /// Name used in error messages
    pub fn canonical(&self) -> &'static str {
        match self {
            FieldKey::PeriodFrom => "period from",
            FieldKey::PeriodTill => "period till",
            FieldKey::Net => "net",
            FieldKey::Invoice => "invoice",
            FieldKey::Tax => "tax",
            FieldKey::DocType => "doctype",
            FieldKey::FullName => "full name",
            FieldKey::Created => "created",
            FieldKey::Currency => "currency",
            FieldKey::PartnerId => "inc",
        }
    }
}

/// Calendar date of a spreadsheet day serial.
///
/// The 1900 system counts 1900-01-01 as day 1 and includes the fictitious
/// 1900-02-29 as day 60, which maps to 1900-02-28 here. From day 61 on the
/// extra day is absorbed by counting from 1899-12-30. The 1904 system counts
/// from 1904-01-01 as day 0.
pub fn serial_to_date(serial: i64, date1904: bool) -> Option<NaiveDate> {
    if serial < 0 {
        return None;
    }
    let (epoch, offset) = if date1904 {
        (NaiveDate::from_ymd_opt(1904, 1, 1)?, serial)
    } else if serial < 60 {
        (NaiveDate::from_ymd_opt(1899, 12, 31)?, serial)
    } else if serial == 60 {
        return NaiveDate::from_ymd_opt(1900, 2, 28);
    } else {
        (NaiveDate::from_ymd_opt(1899, 12, 30)?, serial)
    };
    epoch.checked_add_signed(Duration::days(offset))
}

fn parse_text_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.date_naive());
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(at.date());
    }
    for format in ["%d.%m.%Y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    None
}

/// Date from a serial number or a text date
pub fn parse_date(value: &CellValue, date1904: bool) -> Option<NaiveDate> {
    match value {
        CellValue::Number(raw) => {
            let serial = Decimal::from_str(raw).ok()?.trunc();
            serial_to_date(i64::try_from(serial).ok()?, date1904)
        }
        CellValue::Text(text) => {
            let trimmed = text.trim();
            // Serials typed as text still count as serials
            match trimmed.parse::<i64>() {
                Ok(serial) => serial_to_date(serial, date1904),
                Err(_) => parse_text_date(trimmed),
            }
        }
        _ => None,
    }
}

/// Creation timestamp; serial fractions carry the time of day
pub fn parse_timestamp(value: &CellValue, date1904: bool) -> Option<DateTime<Utc>> {
    match value {
        CellValue::Number(raw) => {
            let serial = Decimal::from_str(raw).ok()?;
            let date = serial_to_date(i64::try_from(serial.trunc()).ok()?, date1904)?;
            let seconds = (serial.fract() * Decimal::from(86_400)).round();
            let seconds = i64::try_from(seconds).ok()?;
            Some(date.and_time(NaiveTime::MIN).and_utc() + Duration::seconds(seconds))
        }
        CellValue::Text(text) => {
            let trimmed = text.trim();
            if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(at.with_timezone(&Utc));
            }
            parse_date(value, date1904).map(|d| d.and_time(NaiveTime::MIN).and_utc())
        }
        _ => None,
    }
}

/// Money value. Text tolerates spaces as thousand separators and a decimal comma.
pub fn parse_amount(value: &CellValue) -> Option<Decimal> {
    match value {
        CellValue::Number(raw) => Decimal::from_str(raw)
            .ok()
            .or_else(|| Decimal::from_scientific(raw).ok()),
        CellValue::Text(text) => {
            let cleaned: String = text
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}

/// Numeric partner id, from a number or text cell
pub fn parse_partner_id(value: &CellValue) -> Option<i64> {
    let raw = match value {
        CellValue::Number(raw) | CellValue::Text(raw) => raw.trim(),
        _ => return None,
    };
    let number = Decimal::from_str(raw).ok()?;
    if number.fract() != Decimal::ZERO || number <= Decimal::ZERO {
        return None;
    }
    i64::try_from(number).ok()
}

/// Non-empty text of a cell
pub fn parse_text(value: &CellValue) -> Option<String> {
    let text = value.display();
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
