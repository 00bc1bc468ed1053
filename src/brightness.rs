//! Display backlight through `brightnessctl`.
use crate::command::{CommandRunner, ExternalCommand};
use crate::scan::{run_checked, ScanError};

/// Program driving this domain.
pub const BRIGHTNESSCTL: &str = "brightnessctl";

/// `brightnessctl get|max`
pub fn read_command(what: &str) -> ExternalCommand {
    ExternalCommand::new(BRIGHTNESSCTL).arg(what)
}

/// `brightnessctl set <percent>%`
pub fn set_command(percent: u8) -> ExternalCommand {
    ExternalCommand::new(BRIGHTNESSCTL).args(["set".to_owned(), format!("{}%", percent.min(100))])
}

/// Raw level printed by `brightnessctl get` or `brightnessctl max`.
pub fn parse_level(stdout: &str) -> Option<u64> {
    stdout.trim().parse().ok()
}

/// Integer percentage of `current` over `max`. A zero maximum yields `None`.
pub fn to_percent(current: u64, max: u64) -> Option<u8> {
    if max == 0 {
        return None;
    }
    Some((u128::from(current.min(max)) * 100 / u128::from(max)) as u8)
}

/// Current brightness in percent, `None` when the tool output makes no sense.
pub fn read_percent(runner: &dyn CommandRunner) -> Result<Option<u8>, ScanError> {
    let current = run_checked(runner, &read_command("get"))?;
    let max = run_checked(runner, &read_command("max"))?;
    Ok(parse_level(&current.stdout)
        .zip(parse_level(&max.stdout))
        .and_then(|(c, m)| to_percent(c, m)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResult, MockCommandRunner};
    use test_log::test;

    #[test]
    fn percent_is_truncated_integer() {
        assert_eq!(to_percent(12000, 24000), Some(50));
        assert_eq!(to_percent(1, 3), Some(33));
        assert_eq!(to_percent(5, 0), None);
        assert_eq!(to_percent(300, 255), Some(100));
    }

    #[test]
    fn huge_levels_do_not_overflow() {
        assert_eq!(to_percent(u64::MAX, u64::MAX), Some(100));
        assert_eq!(to_percent(u64::MAX / 2, u64::MAX), Some(49));
        assert_eq!(to_percent(u64::MAX, 1 << 63), Some(100));
    }

    #[test]
    fn garbage_levels_are_ignored() {
        assert_eq!(parse_level("937\n"), Some(937));
        assert_eq!(parse_level("Failed to get brightness"), None);
        assert_eq!(parse_level(""), None);
    }

    #[test]
    fn read_percent_queries_get_then_max() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["get"]))
            .times(1)
            .returning(|_| Ok(CommandResult::ok("96000\n")));
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["max"]))
            .times(1)
            .returning(|_| Ok(CommandResult::ok("96000\n")));
        assert_eq!(read_percent(&mock).unwrap(), Some(100));
    }

    #[test]
    fn read_percent_without_backlight() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_| Ok(CommandResult::ok("\n")));
        assert_eq!(read_percent(&mock).unwrap(), None);
    }

    #[test]
    fn set_command_clamps() {
        assert_eq!(set_command(120).argv(), ["set", "100%"]);
    }
}
