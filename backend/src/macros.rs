//! Shared macros for the engine crate.

/// Generate a `fmt::Debug` implementation that redacts sensitive fields.
///
/// Three field kinds are supported, specified as a keyword before the field name:
///
/// - `show field_name` - prints the field value normally
/// - `redact field_name` - prints `"[REDACTED]"` instead of the value
/// - `redact_option field_name` - prints `Some("[REDACTED]")` or `None`
///
/// # Example
///
/// ```ignore
/// redacted_debug!(ToolConfig {
///     show storage_path,
///     redact_option encryption_key,
/// });
/// ```
macro_rules! redacted_debug {
    ($name:ident { $( $kind:ident $field:ident ),* $(,)? }) => {
        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let mut s = f.debug_struct(stringify!($name));
                $( redacted_debug!(@add_field s, self, $kind, $field); )*
                s.finish_non_exhaustive()
            }
        }
    };
    (@add_field $s:ident, $self:ident, show, $field:ident) => {
        $s.field(stringify!($field), &$self.$field);
    };
    (@add_field $s:ident, $self:ident, redact, $field:ident) => {
        $s.field(stringify!($field), &"[REDACTED]");
    };
    (@add_field $s:ident, $self:ident, redact_option, $field:ident) => {
        $s.field(stringify!($field), &$self.$field.as_ref().map(|_| "[REDACTED]"));
    };
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    #[test]
    fn test_config_debug_hides_connection_string() {
        let mut config = Config::for_storage("/srv/backups", Some("correct-horse-battery-staple"));
        config.database_url = "postgres://app:pw@db.internal/app".to_string();

        let output = format!("{:?}", config);
        assert!(output.contains("/srv/backups"));
        assert!(!output.contains("app:pw"));
        assert!(!output.contains("correct-horse-battery-staple"));
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn test_config_debug_unset_key_is_none() {
        let config = Config::for_storage("/srv/backups", None);
        let output = format!("{:?}", config);
        assert!(output.contains("encryption_key: None"));
    }
}
