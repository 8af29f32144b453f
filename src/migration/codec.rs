// ABOUTME: SQL literal encoding for every column value the exporter reads
// ABOUTME: Decodes tokio-postgres rows into SqlValue and renders dialect-correct literal text

use crate::utils::quote_literal;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use std::fmt::Write as _;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

/// A single column value read from the source database
///
/// Rendering through [`SqlValue::to_literal`] is total: every variant
/// produces valid literal text and nothing panics.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float4(f32),
    Float8(f64),
    Decimal(Numeric),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    /// Any other type, carried as its text form; `None` renders NULL
    Unknown(Option<String>),
}

impl SqlValue {
    /// Render the value as SQL literal text
    ///
    /// # Examples
    ///
    /// ```
    /// # use postgres_env_sync::migration::codec::{Numeric, SqlValue};
    /// assert_eq!(SqlValue::Text("it's".into()).to_literal(), "'it''s'");
    /// assert_eq!(SqlValue::Decimal(Numeric::new(12345, -2)).to_literal(), "123.45");
    /// assert_eq!(SqlValue::Float8(f64::NAN).to_literal(), "NULL");
    /// ```
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Bytes(b) => format!("E'\\\\x{}'", hex::encode(b)),
            SqlValue::Bool(true) => "TRUE".to_string(),
            SqlValue::Bool(false) => "FALSE".to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::UInt(u) => u.to_string(),
            SqlValue::Float4(f) => float_literal(f.is_finite(), f.to_string()),
            SqlValue::Float8(f) => float_literal(f.is_finite(), f.to_string()),
            SqlValue::Decimal(n) => n.to_plain_string().unwrap_or_else(|| "NULL".to_string()),
            SqlValue::Timestamp(ts) => quote_literal(&format_timestamp(ts)),
            SqlValue::Date(d) => quote_literal(&format_date(d)),
            SqlValue::Uuid(u) => quote_literal(&u.to_string()),
            SqlValue::Unknown(Some(text)) => quote_literal(text),
            SqlValue::Unknown(None) => "NULL".to_string(),
        }
    }
}

/// Render one row as a parenthesized tuple of literals
pub fn tuple_literal(values: &[SqlValue]) -> String {
    let mut out = String::from("(");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&value.to_literal());
    }
    out.push(')');
    out
}

/// Non-finite floats have no literal form and collapse to NULL
fn float_literal(finite: bool, text: String) -> String {
    if !finite {
        return "NULL".to_string();
    }
    if !text.contains('.') {
        return text;
    }
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Fully-qualified UTC timestamp with as many fractional digits as needed (up to nanoseconds)
///
/// Years before 1 AD are written with a `BC` suffix; PostgreSQL rejects
/// signed years. chrono counts year 0 as 1 BC.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    if ts.year() > 0 {
        return ts.to_rfc3339_opts(SecondsFormat::AutoSi, true);
    }
    format!(
        "{:04}-{}+00 BC",
        1 - ts.year(),
        ts.format("%m-%d %H:%M:%S%.f")
    )
}

fn format_date(d: &NaiveDate) -> String {
    if d.year() > 0 {
        return d.format("%Y-%m-%d").to_string();
    }
    format!("{:04}-{} BC", 1 - d.year(), d.format("%m-%d"))
}

/// Arbitrary-precision decimal as an unscaled integer and a base-10 exponent
///
/// The value is `(-1)^negative * unscaled * 10^exponent`. `unscaled` holds
/// only ASCII digits, which keeps precision beyond any fixed-width integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Numeric {
    Finite {
        negative: bool,
        unscaled: String,
        exponent: i32,
    },
    NaN,
    Infinity {
        negative: bool,
    },
}

impl Numeric {
    /// Build a finite decimal from a machine integer and exponent
    pub fn new(unscaled: i128, exponent: i32) -> Self {
        Numeric::Finite {
            negative: unscaled < 0,
            unscaled: unscaled.unsigned_abs().to_string(),
            exponent,
        }
    }

    /// Plain decimal text, or `None` for NaN and infinities
    pub fn to_plain_string(&self) -> Option<String> {
        let (negative, unscaled, exponent) = match self {
            Numeric::Finite {
                negative,
                unscaled,
                exponent,
            } => (*negative, unscaled.as_str(), *exponent),
            Numeric::NaN | Numeric::Infinity { .. } => return None,
        };

        let out = if exponent >= 0 {
            format!("{}{}", unscaled, "0".repeat(exponent as usize))
        } else {
            let point = unscaled.len() as i64 + i64::from(exponent);
            if point > 0 {
                let (int_part, frac_part) = unscaled.split_at(point as usize);
                format!("{}.{}", int_part, frac_part)
            } else {
                format!("0.{}{}", "0".repeat((-point) as usize), unscaled)
            }
        };

        if negative && out != "0" {
            Some(format!("-{}", out))
        } else {
            Some(out)
        }
    }

    /// Decode the PostgreSQL binary NUMERIC representation
    ///
    /// Layout: ndigits i16, weight i16, sign u16, dscale u16, then `ndigits`
    /// base-10000 digits; the first digit is multiplied by `10000^weight`.
    fn from_binary(raw: &[u8]) -> Result<Self, String> {
        const SIGN_POS: u16 = 0x0000;
        const SIGN_NEG: u16 = 0x4000;
        const SIGN_NAN: u16 = 0xC000;
        const SIGN_PINF: u16 = 0xD000;
        const SIGN_NINF: u16 = 0xF000;

        if raw.len() < 8 {
            return Err(format!("numeric header too short: {} bytes", raw.len()));
        }
        let read_u16 = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
        let ndigits = read_u16(0) as i16;
        let weight = read_u16(2) as i16;
        let sign = read_u16(4);
        let dscale = read_u16(6);

        match sign {
            SIGN_NAN => return Ok(Numeric::NaN),
            SIGN_PINF => return Ok(Numeric::Infinity { negative: false }),
            SIGN_NINF => return Ok(Numeric::Infinity { negative: true }),
            SIGN_POS | SIGN_NEG => {}
            other => return Err(format!("invalid numeric sign 0x{:04x}", other)),
        }
        if ndigits < 0 {
            return Err(format!("invalid numeric digit count {}", ndigits));
        }
        let ndigits = ndigits as usize;
        if raw.len() != 8 + ndigits * 2 {
            return Err(format!(
                "numeric length mismatch: expected {} bytes, got {}",
                8 + ndigits * 2,
                raw.len()
            ));
        }

        let target_exponent = -i32::from(dscale);
        if ndigits == 0 {
            return Ok(Numeric::Finite {
                negative: false,
                unscaled: "0".to_string(),
                exponent: target_exponent,
            });
        }

        let mut digits = String::with_capacity(ndigits * 4);
        for i in 0..ndigits {
            let group = read_u16(8 + i * 2);
            if group > 9999 {
                return Err(format!("invalid numeric digit group {}", group));
            }
            let _ = write!(digits, "{:04}", group);
        }

        let mut exponent = 4 * (i32::from(weight) - ndigits as i32 + 1);
        if exponent > target_exponent {
            digits.push_str(&"0".repeat((exponent - target_exponent) as usize));
            exponent = target_exponent;
        }
        while exponent < target_exponent && digits.ends_with('0') {
            digits.pop();
            exponent += 1;
        }

        let trimmed = digits.trim_start_matches('0');
        let unscaled = if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        };

        Ok(Numeric::Finite {
            negative: sign == SIGN_NEG,
            unscaled,
            exponent,
        })
    }
}

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Numeric::from_binary(raw).map_err(Into::into)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Catalog type names the decoder reads natively; other columns are selected as text
///
/// `json` and `jsonb` are read as text so number precision and key order
/// survive unchanged.
const NATIVE_UDT_NAMES: [&str; 17] = [
    "bool",
    "int2",
    "int4",
    "int8",
    "oid",
    "float4",
    "float8",
    "numeric",
    "text",
    "varchar",
    "bpchar",
    "name",
    "bytea",
    "timestamp",
    "timestamptz",
    "date",
    "uuid",
];

/// Whether a column with this catalog type name can be decoded without a text cast
pub fn is_native_type(udt_name: &str) -> bool {
    NATIVE_UDT_NAMES.contains(&udt_name)
}

/// Decode every column of a row, in column order
pub fn decode_row(row: &Row) -> Result<Vec<SqlValue>> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

/// Undecoded wire bytes of one column
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawValue(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

type DecodeError = Box<dyn std::error::Error + Sync + Send>;

fn decode_value(row: &Row, idx: usize) -> Result<SqlValue> {
    let column = &row.columns()[idx];
    let raw = row
        .try_get::<_, Option<RawValue>>(idx)
        .with_context(|| format!("Failed to read column '{}'", column.name()))?;

    decode_raw(column.type_(), raw.map(|r| r.0)).map_err(|e| {
        anyhow::anyhow!(
            "Failed to decode column '{}' ({}): {}",
            column.name(),
            column.type_().name(),
            e
        )
    })
}

/// Decode one binary-format column value; `None` is SQL NULL
fn decode_raw(ty: &Type, raw: Option<&[u8]>) -> Result<SqlValue, DecodeError> {
    let Some(raw) = raw else {
        return Ok(SqlValue::Null);
    };

    let value = match *ty {
        Type::BOOL => SqlValue::Bool(bool::from_sql(ty, raw)?),
        Type::INT2 => SqlValue::Int(i64::from(i16::from_sql(ty, raw)?)),
        Type::INT4 => SqlValue::Int(i64::from(i32::from_sql(ty, raw)?)),
        Type::INT8 => SqlValue::Int(i64::from_sql(ty, raw)?),
        Type::OID => SqlValue::UInt(u64::from(u32::from_sql(ty, raw)?)),
        Type::FLOAT4 => SqlValue::Float4(f32::from_sql(ty, raw)?),
        Type::FLOAT8 => SqlValue::Float8(f64::from_sql(ty, raw)?),
        Type::NUMERIC => SqlValue::Decimal(Numeric::from_sql(ty, raw)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            SqlValue::Text(String::from_sql(ty, raw)?)
        }
        Type::BYTEA => SqlValue::Bytes(Vec::<u8>::from_sql(ty, raw)?),
        Type::TIMESTAMP => match infinity_i64(raw) {
            Some(text) => SqlValue::Unknown(Some(text)),
            None => SqlValue::Timestamp(NaiveDateTime::from_sql(ty, raw)?.and_utc()),
        },
        Type::TIMESTAMPTZ => match infinity_i64(raw) {
            Some(text) => SqlValue::Unknown(Some(text)),
            None => SqlValue::Timestamp(DateTime::<Utc>::from_sql(ty, raw)?),
        },
        Type::DATE => match infinity_i32(raw) {
            Some(text) => SqlValue::Unknown(Some(text)),
            None => SqlValue::Date(NaiveDate::from_sql(ty, raw)?),
        },
        Type::UUID => SqlValue::Uuid(Uuid::from_sql(ty, raw)?),
        _ => {
            if !<String as FromSql<'_>>::accepts(ty) {
                return Err(format!("type '{}' cannot be read as text", ty.name()).into());
            }
            SqlValue::Unknown(Some(String::from_sql(ty, raw)?))
        }
    };

    Ok(value)
}

/// Timestamp columns store +/-infinity as the extreme 64-bit values
fn infinity_i64(raw: &[u8]) -> Option<String> {
    let value = i64::from_be_bytes(raw.try_into().ok()?);
    infinity_text(value == i64::MAX, value == i64::MIN)
}

/// Date columns store +/-infinity as the extreme 32-bit values
fn infinity_i32(raw: &[u8]) -> Option<String> {
    let value = i32::from_be_bytes(raw.try_into().ok()?);
    infinity_text(value == i32::MAX, value == i32::MIN)
}

fn infinity_text(positive: bool, negative: bool) -> Option<String> {
    if positive {
        Some("infinity".to_string())
    } else if negative {
        Some("-infinity".to_string())
    } else {
        None
    }
}
