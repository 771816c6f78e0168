use std::mem::take;

/// Splits CSV text into rows of fields.
///
/// Handles double-quoted fields (with `""` escapes and embedded separators or
/// newlines) and CRLF line endings. Blank lines are skipped. An unterminated
/// quote swallows the rest of the text into the last field.
pub fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            ',' if !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(take(&mut field));
                push_row(&mut rows, take(&mut row));
            }
            _ => field.push(ch),
        }
    }

    row.push(field);
    push_row(&mut rows, row);
    rows
}

/// Byte length of the leading part of `text` made of complete records, i.e.
/// up to and including the last `\n` outside quotes. Quote rules match
/// [`parse_rows`].
pub fn complete_records_len(text: &str) -> usize {
    let mut in_quotes = false;
    let mut field_blank = true;
    let mut end = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if matches!(chars.peek(), Some((_, '"'))) {
                    chars.next();
                    field_blank = false;
                } else {
                    in_quotes = false;
                }
            }
            '"' if field_blank => in_quotes = true,
            ',' | '\r' if !in_quotes => field_blank = true,
            '\n' if !in_quotes => {
                end = idx + 1;
                field_blank = true;
            }
            _ if !ch.is_whitespace() => field_blank = false,
            _ => {}
        }
    }
    end
}

fn push_row(rows: &mut Vec<Vec<String>>, row: Vec<String>) {
    if row.len() == 1 && row[0].trim().is_empty() {
        return;
    }
    rows.push(row);
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

pub fn encode_row<S: AsRef<str>>(row: &[S]) -> String {
    row.iter()
        .map(|cell| {
            let cell = cell.as_ref();
            if needs_quotes(cell) {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell.to_string()
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}
