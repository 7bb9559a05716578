use geofilter_core::request::{BufferUnit, CombineOperator, Predicate};
use geofilter_core::BackendKind;

/// Parse a spatial predicate name
pub fn parse_predicate(s: &str) -> std::result::Result<Predicate, String> {
    s.parse::<Predicate>().map_err(|e| e.to_string())
}

/// Parse a buffer unit (m, km, ft, deg, map)
pub fn parse_buffer_unit(s: &str) -> std::result::Result<BufferUnit, String> {
    s.parse::<BufferUnit>().map_err(|e| e.to_string())
}

/// Parse a combine operator (replace, and, or, and-not)
pub fn parse_combine(s: &str) -> std::result::Result<CombineOperator, String> {
    s.parse::<CombineOperator>().map_err(|e| e.to_string())
}

/// Parse a backend name
pub fn parse_backend(s: &str) -> std::result::Result<BackendKind, String> {
    s.parse::<BackendKind>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsers() {
        assert_eq!(parse_predicate("Within").unwrap(), Predicate::Within);
        assert_eq!(parse_buffer_unit("km").unwrap(), BufferUnit::Kilometers);
        assert_eq!(parse_combine("and-not").unwrap(), CombineOperator::AndNot);
        assert_eq!(parse_backend("spatialite").unwrap(), BackendKind::Embedded);
        assert!(parse_predicate("near").is_err());
    }
}
