//! HMM-based generation with HMGenS over the composed models.

use crate::command::ToolCommand;
use crate::composition::compose_all;
use crate::config::Context;
use crate::hts_config::write_configurations;
use crate::stage::StageRunner;
use crate::stream_io::utterance_file;
use crate::utterance::{Utterance, UtteranceSet};
use crate::worker_pool::Ledger;
use anyhow::{Context as _, Result};
use std::path::Path;
use tracing::info;

pub fn generate(
    runner: &StageRunner<'_>,
    utterances: &UtteranceSet,
    use_gv: bool,
    ledger: &mut Ledger,
) -> Result<()> {
    let ctx = runner.ctx.as_ref();
    write_configurations(ctx, use_gv)?;
    compose_all(ctx, use_gv)?;

    info!("Parameter generation");
    // HMGenS writes every output of a list into one directory
    for (i, (bucket, members)) in utterances.buckets().into_iter().enumerate() {
        let members: Vec<&Utterance> = members
            .into_iter()
            .filter(|u| !ledger.is_failed(&u.base))
            .collect();
        if members.is_empty() {
            continue;
        }
        let target = runner.out_dir.join(&bucket);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("cannot create {}", target.display()))?;

        let list = ctx.scratch.utterance_list(i);
        let content = members
            .iter()
            .map(|u| u.label.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(&list, content + "\n")
            .with_context(|| format!("cannot write {}", list.display()))?;

        hmgens(ctx, &list, &target)
            .run_checked()
            .with_context(|| format!("parameter generation failed for {}", target.display()))?;
    }

    for base in ledger.active(&utterances.bases()) {
        if !utterance_file(runner.out_dir, &base, "dur").is_file() {
            ledger.record("generation", &base, "HMGenS produced no duration file");
        }
    }
    Ok(())
}

pub fn hmgens(ctx: &Context, list: &Path, out_dir: &Path) -> ToolCommand {
    let mut command = ToolCommand::new(&ctx.tools.hmgens);
    if ctx.options.imposed_duration {
        command = command.arg("-m");
    }
    command
        .args(["-A", "-B", "-C"])
        .arg(ctx.scratch.synth_config())
        .args(["-D", "-T", "1", "-S"])
        .arg(list)
        .arg("-t")
        .args(ctx.training.beam_args())
        .arg("-c")
        .arg(ctx.options.pg_type.to_string())
        .arg("-H")
        .arg(ctx.scratch.composed_model("cmp"))
        .arg("-N")
        .arg(ctx.scratch.composed_model("dur"))
        .arg("-M")
        .arg(out_dir)
        .arg(ctx.scratch.tied_list("cmp"))
        .arg(ctx.scratch.tied_list("dur"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{context_from, sample_document, sample_context};
    use crate::config::RunOptions;

    #[test]
    fn hmgens_command_line() {
        let ctx = sample_context();
        let command = hmgens(&ctx, Path::new("/tmp/run/list_input_labels_0"), Path::new("out"));
        assert_eq!(
            command.display(),
            "HMGenS -A -B -C /tmp/run/synth.cfg -D -T 1 -S /tmp/run/list_input_labels_0 \
             -t 1500 100 5000 -c 0 -H /tmp/run/cmp.mmf -N /tmp/run/dur.mmf -M out \
             /tmp/run/tiedlist_cmp /tmp/run/tiedlist_dur"
        );
    }

    #[test]
    fn imposed_duration_uses_the_label_alignment() {
        let mut options = RunOptions::new("c.json", "/tmp/run");
        options.imposed_duration = true;
        options.pg_type = 1;
        let ctx = context_from(sample_document(), options).unwrap();
        let line = hmgens(&ctx, Path::new("l"), Path::new("o")).display();
        assert!(line.starts_with("HMGenS -m -A"));
        assert!(line.contains(" -c 1 "));
    }
}
