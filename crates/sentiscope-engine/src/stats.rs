//! Summary statistics over a CSV result store.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use sentiscope_contracts::csv::{encode_row, parse_rows};
use sentiscope_contracts::records::{COUNTER_FIELDS, SENTIMENT_FIELDS};

pub const DESCRIBE_HEADER: [&str; 9] =
    ["column", "count", "mean", "std", "min", "25%", "50%", "75%", "max"];

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; `None` with fewer than two values.
    pub std: Option<f64>,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolarityCounts {
    pub column: String,
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreStats {
    pub rows: usize,
    pub columns: Vec<ColumnStats>,
    pub polarity: Vec<PolarityCounts>,
}

impl StoreStats {
    pub fn describe_csv(&self) -> String {
        let mut out = encode_row(&DESCRIBE_HEADER);
        out.push('\n');
        for column in &self.columns {
            let row = [
                column.column.clone(),
                column.count.to_string(),
                format_stat(column.mean),
                column.std.map(format_stat).unwrap_or_default(),
                format_stat(column.min),
                format_stat(column.q25),
                format_stat(column.median),
                format_stat(column.q75),
                format_stat(column.max),
            ];
            out.push_str(&encode_row(&row));
            out.push('\n');
        }
        out
    }

    /// Fixed-width table for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} rows", self.rows);
        let _ = writeln!(
            out,
            "{:<24}{:>8}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}{:>10}",
            "column", "count", "mean", "std", "min", "25%", "50%", "75%", "max"
        );
        for column in &self.columns {
            let _ = writeln!(
                out,
                "{:<24}{:>8}{:>10.3}{:>10}{:>10.3}{:>10.3}{:>10.3}{:>10.3}{:>10.3}",
                column.column,
                column.count,
                column.mean,
                column
                    .std
                    .map(|std| format!("{std:.3}"))
                    .unwrap_or_else(|| "-".to_string()),
                column.min,
                column.q25,
                column.median,
                column.q75,
                column.max
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<24}{:>10}{:>10}{:>10}",
            "polarity", "positive", "neutral", "negative"
        );
        for counts in &self.polarity {
            let _ = writeln!(
                out,
                "{:<24}{:>10}{:>10}{:>10}",
                counts.column, counts.positive, counts.neutral, counts.negative
            );
        }
        out
    }
}

pub fn load_store_stats(path: &Path) -> Result<StoreStats> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    Ok(store_stats(&parse_rows(&raw)))
}

/// Statistics for the numeric columns present in `rows` (first row is the
/// header). Empty or non-numeric cells are skipped.
pub fn store_stats(rows: &[Vec<String>]) -> StoreStats {
    let Some((header, data)) = rows.split_first() else {
        return StoreStats::default();
    };
    let column_index = |name: &str| header.iter().position(|cell| cell.trim() == name);

    let numeric = std::iter::once("completeness")
        .chain(COUNTER_FIELDS)
        .chain(SENTIMENT_FIELDS);
    let columns = numeric
        .filter_map(|name| {
            let idx = column_index(name)?;
            let values = data
                .iter()
                .filter_map(|row| row.get(idx))
                .filter_map(|cell| cell.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .collect::<Vec<f64>>();
            describe(name, values)
        })
        .collect();

    let polarity = SENTIMENT_FIELDS
        .iter()
        .filter_map(|name| {
            let idx = column_index(name)?;
            let mut counts = PolarityCounts {
                column: name.to_string(),
                ..PolarityCounts::default()
            };
            for row in data {
                let score = row.get(idx).and_then(|cell| cell.trim().parse::<f64>().ok());
                match score {
                    Some(value) if value > 0.0 => counts.positive += 1,
                    Some(value) if value < 0.0 => counts.negative += 1,
                    _ => counts.neutral += 1,
                }
            }
            Some(counts)
        })
        .collect();

    StoreStats {
        rows: data.len(),
        columns,
        polarity,
    }
}

pub fn describe(column: &str, mut values: Vec<f64>) -> Option<ColumnStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std = (count > 1).then(|| {
        let variance = values
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / (count - 1) as f64;
        variance.sqrt()
    });
    Some(ColumnStats {
        column: column.to_string(),
        count,
        mean,
        std,
        min: values[0],
        q25: quantile(&values, 0.25),
        median: quantile(&values, 0.5),
        q75: quantile(&values, 0.75),
        max: values[count - 1],
    })
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

fn format_stat(value: f64) -> String {
    let rounded = format!("{value:.6}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use sentiscope_contracts::records::STORE_HEADER;

    use super::{describe, format_stat, quantile, store_stats};

    fn approx(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!(approx(quantile(&sorted, 0.25), 1.75));
        assert!(approx(quantile(&sorted, 0.5), 2.5));
        assert!(approx(quantile(&sorted, 0.75), 3.25));
        assert!(approx(quantile(&[7.0], 0.75), 7.0));
    }

    #[test]
    fn describe_uses_sample_standard_deviation() {
        let stats = describe("likes", vec![4.0, 2.0, 6.0, 8.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert!(approx(stats.mean, 5.0));
        assert!(approx(stats.std.unwrap(), (20.0f64 / 3.0).sqrt()));
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 8.0);
        assert!(describe("likes", vec![3.0]).unwrap().std.is_none());
        assert!(describe("likes", Vec::new()).is_none());
    }

    #[test]
    fn store_stats_cover_numeric_columns_and_polarity() {
        let header = STORE_HEADER.iter().map(|cell| cell.to_string()).collect::<Vec<String>>();
        let row = |pro: &str, likes: &str| {
            let mut row = vec![String::new(); STORE_HEADER.len()];
            row[2] = "1".to_string();
            row[7] = likes.to_string();
            row[13] = pro.to_string();
            row
        };
        let rows = vec![header, row("0.5", "10"), row("-0.5", "20"), row("0", "x"), row("", "30")];
        let stats = store_stats(&rows);

        assert_eq!(stats.rows, 4);
        let likes = stats.columns.iter().find(|column| column.column == "likes").unwrap();
        assert_eq!(likes.count, 3);
        assert!(approx(likes.median, 20.0));
        assert!(stats.columns.iter().all(|column| column.column != "tweet_id"));

        let pro = stats.polarity.iter().find(|counts| counts.column == "pro_trump").unwrap();
        assert_eq!((pro.positive, pro.neutral, pro.negative), (1, 2, 1));
    }

    #[test]
    fn stat_formatting_trims_zeros() {
        assert_eq!(format_stat(2.5), "2.5");
        assert_eq!(format_stat(3.0), "3");
        assert_eq!(format_stat(-0.0000001), "0");
    }
}
