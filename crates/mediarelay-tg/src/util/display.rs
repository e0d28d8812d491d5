use std::time::Duration;

pub(crate) fn human_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Formats the duration as `1m 05s` or `42s` rounding up to whole seconds.
pub(crate) fn human_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs += 1;
    }
    let (mins, secs) = (secs / 60, secs % 60);
    if mins == 0 {
        return format!("{secs}s");
    }
    format!("{mins}m {secs:02}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn human_duration_rounds_up() {
        let actual = [
            Duration::ZERO,
            Duration::from_millis(1),
            Duration::from_secs(59),
            Duration::from_secs(60),
            Duration::from_millis(65_500),
        ]
        .map(human_duration);

        expect![[r#"["0s", "1s", "59s", "1m 00s", "1m 06s"]"#]].assert_eq(&format!("{actual:?}"));
    }
}
