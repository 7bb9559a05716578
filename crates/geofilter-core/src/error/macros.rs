//! Error macros for geofilter

/// Macro for returning invalid value errors
#[macro_export]
macro_rules! bail_invalid {
    ($context:expr, $value:expr) => {
        return Err($crate::error::FilterError::invalid_value($context, $value))
    };
}

/// Macro for returning invalid expression errors
#[macro_export]
macro_rules! bail_expression {
    ($($arg:tt)*) => {
        return Err($crate::error::FilterError::invalid_expression(format!($($arg)*)))
    };
}

/// Macro for mapping storage errors onto a dataset
#[macro_export]
macro_rules! map_storage_err {
    ($dataset:expr, $error:expr) => {
        $crate::error::FilterError::storage($dataset, $error)
    };
}
