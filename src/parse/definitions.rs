use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Output variable name -> expression text.
pub type Definitions = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum DefinitionsError {
    #[error("line {line}: expected 'name = expression'")]
    MissingAssignment { line: usize },
    #[error("line {line}: invalid variable name '{name}'")]
    InvalidName { line: usize, name: String },
    #[error("line {line}: '{name}' is already defined on line {first}")]
    Duplicate { line: usize, name: String, first: usize },
    #[error("failed to read definitions: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid definitions JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Parses the `name = expression` text format. Blank lines and `#` comments
/// are ignored; the expression itself is kept verbatim for the parser.
pub fn parse_definitions_text(text: &str) -> Result<Definitions, DefinitionsError> {
    let mut defs = Definitions::new();
    let mut lines_seen: BTreeMap<String, usize> = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let content = strip_comment(raw).trim();
        if content.is_empty() {
            continue;
        }
        let Some((name, expr)) = content.split_once('=') else {
            return Err(DefinitionsError::MissingAssignment { line });
        };
        let name = name.trim();
        if !valid_name(name) {
            return Err(DefinitionsError::InvalidName { line, name: name.to_string() });
        }
        if let Some(&first) = lines_seen.get(name) {
            return Err(DefinitionsError::Duplicate { line, name: name.to_string(), first });
        }
        lines_seen.insert(name.to_string(), line);
        defs.insert(name.to_string(), expr.trim().to_string());
    }

    Ok(defs)
}

// A '#' inside a quoted string does not start a comment.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(_), '\\') if !escaped => {
                escaped = true;
                continue;
            }
            (Some(q), c) if c == q && !escaped => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, '#') => return &line[..i],
            _ => {}
        }
        escaped = false;
    }
    line
}

/// Loads definitions from a `.json` object or from the text format.
pub fn load_definitions(path: &Path) -> Result<Definitions, DefinitionsError> {
    let text = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|e| e == "json") {
        Ok(serde_json::from_str(&text)?)
    } else {
        parse_definitions_text(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_format_with_comments() {
        let text = "\
# temperature in celsius
tas_c = tas - 273.15   # offset
pr = convert(precip, units='kg m-2 s-1')

label = f(x, name='a#b')
";
        let defs = parse_definitions_text(text).unwrap();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs["tas_c"], "tas - 273.15");
        assert_eq!(defs["pr"], "convert(precip, units='kg m-2 s-1')");
        assert_eq!(defs["label"], "f(x, name='a#b')");
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let err = parse_definitions_text("a = x\nb = y\na = z\n").unwrap_err();
        assert!(matches!(err, DefinitionsError::Duplicate { line: 3, first: 1, .. }));
    }

    #[test]
    fn test_missing_assignment_and_bad_name() {
        assert!(matches!(
            parse_definitions_text("just an expression").unwrap_err(),
            DefinitionsError::MissingAssignment { line: 1 }
        ));
        assert!(matches!(
            parse_definitions_text("2x = y").unwrap_err(),
            DefinitionsError::InvalidName { .. }
        ));
    }

    #[test]
    fn test_load_json_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defs.json");
        std::fs::write(&path, r#"{"tas": "t2m", "ps": "sp / 100"}"#).unwrap();
        let defs = load_definitions(&path).unwrap();
        assert_eq!(defs["ps"], "sp / 100");
    }
}
