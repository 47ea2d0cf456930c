use http::header::HeaderName;

use super::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http1HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl Http1HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name_string = name.into();
        let lower_name = name_string.to_ascii_lowercase();
        let value_string = value.into();
        Self {
            name: name_string,
            value: value_string,
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }

    /// Parse a single `Name: value` line without its line terminator.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::malformed("header missing ':' separator"))?;
        if name.is_empty() || name.ends_with(char::is_whitespace) {
            return Err(ParseError::malformed(format!("invalid header name '{name}'")));
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ParseError::malformed(format!("invalid header name '{name}'")))?;
        Ok(Self::new(name, value.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_trims_value() {
        let header = Http1HeaderLine::parse("Accept-Encoding:   gzip ").unwrap();
        assert_eq!(header.name, "Accept-Encoding");
        assert_eq!(header.value, "gzip");
        assert_eq!(header.lower_name(), "accept-encoding");
    }

    #[test]
    fn rejects_whitespace_before_colon() {
        assert!(Http1HeaderLine::parse("Host : example.com").is_err());
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(Http1HeaderLine::parse("no separator").is_err());
    }
}
