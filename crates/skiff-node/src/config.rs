//! Node configuration: an optional TOML file with command-line overrides
//! layered on top, resolved into a [`SessionConfig`].

use std::path::Path;

use anyhow::Context;
use skiff_transport::config::SimulationConfigInput;
use skiff_transport::{SessionConfig, SessionConfigInput};

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub loss: Option<f64>,
    pub latency_ms: Option<(u64, u64)>,
    pub seed: Option<u64>,
    pub no_timeouts: bool,
}

impl Overrides {
    fn apply(self, input: &mut SessionConfigInput) {
        if let Some(bind) = self.bind {
            input.bind = Some(bind);
        }
        if self.no_timeouts {
            input.timeouts_enabled = Some(false);
        }
        if self.loss.is_none() && self.latency_ms.is_none() && self.seed.is_none() {
            return;
        }
        let sim = input
            .simulation
            .get_or_insert_with(SimulationConfigInput::default);
        if let Some(loss) = self.loss {
            sim.loss = Some(loss);
        }
        if let Some((min, max)) = self.latency_ms {
            sim.min_latency_ms = Some(min);
            sim.max_latency_ms = Some(max);
        }
        if let Some(seed) = self.seed {
            sim.seed = Some(seed);
        }
    }
}

/// Parse `--latency-ms` as `N` or `MIN-MAX`.
pub fn parse_latency(s: &str) -> Result<(u64, u64), String> {
    let parse = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("{v:?}: {e}"));
    match s.split_once('-') {
        Some((min, max)) => Ok((parse(min)?, parse(max)?)),
        None => {
            let ms = parse(s)?;
            Ok((ms, ms))
        }
    }
}

pub fn load(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<SessionConfig> {
    let mut input = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            from_toml(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SessionConfigInput::default(),
    };
    overrides.apply(&mut input);
    Ok(input.resolve()?)
}

fn from_toml(text: &str) -> anyhow::Result<SessionConfigInput> {
    Ok(toml::from_str(text)?)
}
