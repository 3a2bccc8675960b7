use clap::Args;
use miette::miette;
use weir_core::window::WindowOverride;

/// Window overrides, positional or as flags.
#[derive(Debug, Clone, Default, Args)]
pub struct WindowArgs {
    /// Start date (YYYY-MM-DD) and/or mode token (mode=F<days>), in any order
    #[arg(value_name = "START_DATE | MODE", num_args = 0..=2)]
    pub overrides: Vec<String>,

    /// Window start, midnight UTC
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub start_date: Option<String>,

    /// FULL load with an optional window size in days
    #[arg(long, value_name = "F<days>")]
    pub mode: Option<String>,
}

fn is_mode_token(token: &str) -> bool {
    let token = token.trim();
    token.starts_with("mode=")
        || token.starts_with("config=")
        || token.starts_with('F')
        || token.starts_with('f')
}

impl WindowArgs {
    /// Sorts the positional tokens into start date and mode and parses both
    pub fn to_override(&self) -> miette::Result<WindowOverride> {
        let mut start = self.start_date.clone();
        let mut mode = self.mode.clone();

        for token in &self.overrides {
            let (slot, what) = if is_mode_token(token) {
                (&mut mode, "mode")
            } else {
                (&mut start, "start date")
            };

            if slot.is_some() {
                return Err(miette!("The window {what} was given more than once"));
            }
            *slot = Some(token.clone());
        }

        Ok(WindowOverride::parse(start.as_deref(), mode.as_deref())?)
    }
}
