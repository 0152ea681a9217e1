//! Models command handlers.

use anyhow::{Context, Result};
use docchat_core::config::Config;
use docchat_core::models::{self, AVAILABLE_MODELS};

pub fn list(config: &Config) {
    for model in AVAILABLE_MODELS {
        let marker = if model.id == config.model { "*" } else { " " };
        println!(
            "{marker} {:<10} {:<10} {}",
            model.id, model.label, model.description
        );
    }
    if models::find_model(&config.model).is_none() {
        println!("* {:<10} (custom)", config.model);
    }
}

pub fn set(model: &str) -> Result<()> {
    let model = model.trim();
    if model.is_empty() {
        anyhow::bail!("Model name is empty");
    }

    let id = match models::find_model(model) {
        Some(known) => known.id,
        None => {
            eprintln!("Note: '{model}' is not a built-in model; make sure it is pulled on the server.");
            model
        }
    };

    Config::save_model(id).with_context(|| format!("save model '{id}'"))?;
    println!("Default model set to {id}");
    Ok(())
}
