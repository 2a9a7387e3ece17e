//! A small precondition-collecting helper the CLI commands use before
//! doing any work: gather every requirement up front, report all failures
//! together rather than stopping at the first one.

use anyhow::{anyhow, Result};
use log::{debug, error, info};

pub struct Validation {
    name: String,
    failures: Vec<String>,
}

impl Validation {
    pub fn new(name: &str) -> Self {
        info!("validating {}", name);
        Self { name: name.to_owned(), failures: Vec::new() }
    }

    pub fn require(&mut self, requirement: &str, state: bool) {
        if state {
            debug!("requirement satisfied: {}", requirement);
        } else {
            error!("requirement failed: {}", requirement);
            self.failures.push(requirement.to_owned());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.failures.is_empty() {
            debug!("fully validated: {}", self.name);
            Ok(())
        } else {
            Err(anyhow!("{} failed validation: {}", Self::capitalize(&self.name), self.failures.join(", ")))
        }
    }

    fn capitalize(text: &str) -> String {
        let mut out = text.to_owned();
        if let Some(c) = out.get_mut(0..1) {
            c.make_ascii_uppercase();
        }
        out
    }
}
