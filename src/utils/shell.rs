//! Quoting for commands sent to a remote shell.

/// Wrap `value` in single quotes, escaping embedded quotes as `'\''`.
pub fn quote_path(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Prefix a command with `cd <dir> &&`.
pub fn in_dir(dir: &str, command: &str) -> String {
    format!("cd {} && {}", quote_path(dir), command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(quote_path("/var/www/it's"), "'/var/www/it'\\''s'");
        assert_eq!(quote_path(""), "''");
    }

    #[test]
    fn in_dir_quotes_directory() {
        assert_eq!(
            in_dir("/srv/wiki", "php maintenance/update.php"),
            "cd '/srv/wiki' && php maintenance/update.php"
        );
    }
}
