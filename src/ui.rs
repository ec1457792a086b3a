// UI layer: the interactive prompts used by `login` and `init`, built on
// `dialoguer`, plus an `indicatif` spinner for slow API calls.
// Everything here talks to the terminal; command logic lives in `cli`.

use anyhow::Result;
use crossterm::style::Stylize;
use dialoguer::{Input, Password, Select};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::api::{Site, Theme};

/// Ask for login and password. `Password` keeps the input hidden.
pub fn prompt_credentials() -> Result<(String, String)> {
    let user: String = Input::new().with_prompt("Login").interact_text()?;
    let password = Password::new().with_prompt("Password").interact()?;
    Ok((user.trim().to_string(), password))
}

/// Keyboard-navigable list of sites; returns the chosen index.
pub fn choose_site(sites: &[Site]) -> Result<usize> {
    let items: Vec<String> = sites
        .iter()
        .map(|s| format!("{} => http://{}", s.name, s.domain))
        .collect();
    let index = Select::new()
        .with_prompt("Which site do you want to work on?")
        .items(&items)
        .default(0)
        .interact()?;
    Ok(index)
}

pub fn choose_theme(themes: &[Theme]) -> Result<usize> {
    let items: Vec<&str> = themes.iter().map(|t| t.name.as_str()).collect();
    let index = Select::new()
        .with_prompt("Which theme do you want to work on?")
        .items(&items)
        .default(0)
        .interact()?;
    Ok(index)
}

/// A ticking spinner; call `finish_and_clear` when the work is done.
pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn success(message: &str) {
    println!("{}", message.green().bold());
}
