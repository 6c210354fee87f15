//! Acoustic parameter generation: labels in, per-utterance streams out.

pub mod default;
pub mod dnn;

use crate::config::GeneratorKind;
use crate::stage::StageRunner;
use crate::utterance::UtteranceSet;
use crate::worker_pool::Ledger;
use anyhow::Result;
use tracing::info;

pub fn generate(
    kind: GeneratorKind,
    runner: &StageRunner<'_>,
    utterances: &UtteranceSet,
    use_gv: bool,
    ledger: &mut Ledger,
) -> Result<()> {
    match kind {
        GeneratorKind::None => {
            info!("No parameter generation, the parameters are expected in the output directory");
            Ok(())
        }
        GeneratorKind::Default => default::generate(runner, utterances, use_gv, ledger),
        GeneratorKind::Dnn => dnn::generate(runner, utterances, use_gv, ledger),
    }
}
