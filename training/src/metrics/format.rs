use std::time::Duration;

use super::{MetricsErr, Result};

/// A statistic a meter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stat {
    Median,
    Avg,
    GlobalAvg,
    Max,
    Value,
}

impl Stat {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "median" => Stat::Median,
            "avg" => Stat::Avg,
            "global_avg" => Stat::GlobalAvg,
            "max" => Stat::Max,
            "value" => Stat::Value,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Literal(String),
    Field {
        stat: Stat,
        width: Option<usize>,
        precision: Option<usize>,
    },
}

/// A parsed meter format such as `"{median:.4} ({global_avg:.4})"`.
///
/// Placeholders name a statistic and take an optional `width.precision` spec,
/// a trailing `f` is accepted and ignored. `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Template {
    source: String,
    pieces: Vec<Piece>,
}

impl Template {
    pub(super) fn parse(source: &str) -> Result<Self> {
        let invalid = |detail: String| MetricsErr::Format {
            fmt: source.to_string(),
            detail,
        };

        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let field: String = chars.by_ref().take_while(|&c| c != '}').collect();
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(parse_field(&field).map_err(invalid)?);
                }
                '}' => return Err(invalid("unmatched `}`".to_string())),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            pieces,
        })
    }

    pub(super) fn as_str(&self) -> &str {
        &self.source
    }

    /// Renders the template, asking `stat` for every placeholder's value.
    pub(super) fn render(&self, stat: impl Fn(Stat) -> Option<f64>) -> String {
        let mut out = String::new();

        for piece in &self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Field {
                    stat: which,
                    width,
                    precision,
                } => {
                    let v = stat(*which).unwrap_or(f64::NAN);
                    let s = match (*width, *precision) {
                        (Some(w), Some(p)) => format!("{v:w$.p$}"),
                        (Some(w), None) => format!("{v:w$}"),
                        (None, Some(p)) => format!("{v:.p$}"),
                        (None, None) => format!("{v}"),
                    };
                    out.push_str(&s);
                }
            }
        }

        out
    }
}

fn parse_field(field: &str) -> std::result::Result<Piece, String> {
    let (name, spec) = field.split_once(':').unwrap_or((field, ""));
    let stat = Stat::parse(name.trim()).ok_or_else(|| format!("unknown statistic `{name}`"))?;

    let spec = spec.strip_suffix('f').unwrap_or(spec);
    let (width, precision) = spec.split_once('.').unwrap_or((spec, ""));

    let number = |s: &str| -> std::result::Result<Option<usize>, String> {
        if s.is_empty() {
            return Ok(None);
        }
        s.parse()
            .map(Some)
            .map_err(|_| format!("invalid format spec `{field}`"))
    };

    Ok(Piece::Field {
        stat,
        width: number(width)?,
        precision: number(precision)?,
    })
}

/// Formats a duration as `H:MM:SS`.
pub(crate) fn hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
