//! Boiler parameter records: the two response shapes the vendor protocol
//! uses for `$par get ...` replies.
//!
//! Select parameter wire format:
//!   `$PR<nnn>;6;<current>;<max>;<default>;0;0;0;<name>;<option1>;…;<optionN>;0;`
//!
//! Numeric parameter wire format:
//!   `$<id>;3;<current>;<min>;<max>;<step>;<unit>;<default>;0;0;0;<name>;`

use std::fmt;

const SELECT_TYPE_CODE: &str = "6";
const NUMBER_TYPE_CODE: &str = "3";

#[derive(Debug, Clone, PartialEq)]
pub enum BoilerParameter {
    Select(SelectParameter),
    Number(NumberParameter),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectParameter {
    pub id: String,
    pub name: String,
    pub options: Vec<String>,
    pub current_index: usize,
    pub default_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberParameter {
    pub id: String,
    pub name: String,
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub increment: f64,
    pub unit: String,
    pub default: f64,
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    /// The line isn't a `$`-prefixed parameter record at all.
    NotAParameterLine,
    /// The line has an unrecognised type code (neither `3` nor `6`).
    UnknownTypeCode(String),
    /// A well-formed record is missing a field the shape requires.
    MissingField { shape: &'static str, field: &'static str },
    /// A field that must be numeric wasn't.
    InvalidNumber { field: &'static str, value: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NotAParameterLine => write!(f, "not a parameter record"),
            ParseError::UnknownTypeCode(code) => write!(f, "unknown parameter type code '{code}'"),
            ParseError::MissingField { shape, field } => {
                write!(f, "{shape} parameter record missing field '{field}'")
            }
            ParseError::InvalidNumber { field, value } => {
                write!(f, "field '{field}' is not numeric: '{value}'")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl BoilerParameter {
    pub fn id(&self) -> &str {
        match self {
            BoilerParameter::Select(p) => &p.id,
            BoilerParameter::Number(p) => &p.id,
        }
    }

    /// Parse one CRLF-stripped `$`-prefixed semicolon-delimited record.
    pub fn parse_line(line: &str) -> Result<BoilerParameter, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let body = line.strip_prefix('$').ok_or(ParseError::NotAParameterLine)?;

        let mut fields: Vec<&str> = body.split(';').collect();
        // A trailing ';' in the wire format produces a trailing empty field.
        if fields.last() == Some(&"") {
            fields.pop();
        }
        if fields.len() < 2 {
            return Err(ParseError::NotAParameterLine);
        }

        let id = fields[0].to_owned();
        let type_code = fields[1];
        match type_code {
            SELECT_TYPE_CODE => parse_select(id, &fields),
            NUMBER_TYPE_CODE => parse_number(id, &fields),
            other => Err(ParseError::UnknownTypeCode(other.to_owned())),
        }
    }

    /// Re-serialise in the canonical wire format this module produces.
    /// Not guaranteed byte-identical to whatever the boiler originally sent
    /// (padding fields are normalised to `0`), only idempotent under
    /// parse → serialise → parse.
    pub fn to_line(&self) -> String {
        match self {
            BoilerParameter::Select(p) => {
                let mut out = format!(
                    "${};{};{};{};{};0;0;0;{}",
                    p.id,
                    SELECT_TYPE_CODE,
                    p.current_index,
                    p.options.len().saturating_sub(1),
                    p.default_index,
                    p.name,
                );
                for opt in &p.options {
                    out.push(';');
                    out.push_str(opt);
                }
                out.push_str(";0;");
                out
            }
            BoilerParameter::Number(p) => format!(
                "${};{};{};{};{};{};{};{};0;0;0;{};",
                p.id,
                NUMBER_TYPE_CODE,
                format_decimal(p.current),
                format_decimal(p.min),
                format_decimal(p.max),
                format_decimal(p.increment),
                p.unit,
                format_decimal(p.default),
            ),
        }
    }
}

fn parse_select(id: String, fields: &[&str]) -> Result<BoilerParameter, ParseError> {
    const SHAPE: &str = "select";
    let current_index = parse_index(fields, 2, SHAPE, "current")?;
    let default_index = parse_index(fields, 4, SHAPE, "default")?;
    let name = fields
        .get(8)
        .ok_or(ParseError::MissingField { shape: SHAPE, field: "name" })?
        .to_string();
    // Fields 9.. are options, except a trailing "0" sentinel left over from
    // the wire format's closing ";0;".
    let mut options: Vec<String> = fields[9.min(fields.len())..]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if options.last().map(String::as_str) == Some("0") {
        options.pop();
    }
    if options.is_empty() {
        return Err(ParseError::MissingField { shape: SHAPE, field: "options" });
    }
    Ok(BoilerParameter::Select(SelectParameter {
        id,
        name,
        options,
        current_index,
        default_index,
    }))
}

fn parse_number(id: String, fields: &[&str]) -> Result<BoilerParameter, ParseError> {
    const SHAPE: &str = "number";
    let current = parse_f64(fields, 2, SHAPE, "current")?;
    let min = parse_f64(fields, 3, SHAPE, "min")?;
    let max = parse_f64(fields, 4, SHAPE, "max")?;
    let increment = parse_f64(fields, 5, SHAPE, "increment")?;
    let unit = fields
        .get(6)
        .ok_or(ParseError::MissingField { shape: SHAPE, field: "unit" })?
        .to_string();
    let default = parse_f64(fields, 7, SHAPE, "default")?;
    let name = fields
        .get(11)
        .ok_or(ParseError::MissingField { shape: SHAPE, field: "name" })?
        .to_string();
    Ok(BoilerParameter::Number(NumberParameter {
        id,
        name,
        current,
        min,
        max,
        increment,
        unit,
        default,
    }))
}

fn parse_index(
    fields: &[&str],
    at: usize,
    shape: &'static str,
    field: &'static str,
) -> Result<usize, ParseError> {
    let raw = fields.get(at).ok_or(ParseError::MissingField { shape, field })?;
    raw.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: (*raw).to_owned(),
    })
}

fn parse_f64(
    fields: &[&str],
    at: usize,
    shape: &'static str,
    field: &'static str,
) -> Result<f64, ParseError> {
    let raw = fields.get(at).ok_or(ParseError::MissingField { shape, field })?;
    raw.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: (*raw).to_owned(),
    })
}

/// Numeric parameter fields carry up to three fractional digits; trim
/// trailing zeros like the boiler itself does for whole values (e.g. `"1"`,
/// not `"1.000"`).
fn format_decimal(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        let s = format!("{rounded:.3}");
        s.trim_end_matches('0').trim_end_matches('.').to_owned()
    }
}
