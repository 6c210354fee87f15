//! HTK-style configuration files consumed by HHEd and HMGenS.

use crate::config::{Context, StreamDescriptor};
use anyhow::{Context as _, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// Configuration used by HHEd while growing the trees for unseen labels.
pub fn training_configuration(ctx: &Context) -> String {
    let mut out = String::new();
    out.push_str("NATURALREADORDER = T\n");
    out.push_str("NATURALWRITEORDER = T\n");
    out.push_str("APPLYVFLOOR = T\n");

    let (count, floors) = variance_floors(&ctx.streams);
    let _ = writeln!(out, "VFLOORSCALESTR = \"Vector {count} {floors}\"");

    out.push_str("APPLYDURVARFLOOR = T\n");
    let _ = writeln!(out, "DURVARFLOORPERCENTILE = {:.6}", 100.0 * ctx.dur_vflr);
    let _ = writeln!(out, "MAXSTDDEVCOEF = {}", ctx.training.maxdev);
    let _ = writeln!(out, "MINDUR = {}", ctx.training.mindur);
    out
}

/// MSD streams carry one floor per window.
fn variance_floors(streams: &[StreamDescriptor]) -> (usize, String) {
    let mut count = 0;
    let mut floors = String::new();
    for stream in streams {
        let repeat = if stream.is_msd { stream.winfiles.len() } else { 1 };
        count += repeat;
        floors.push(' ');
        floors.push_str(&vec![stream.vflr.to_string(); repeat].join(" "));
    }
    (count, floors)
}

/// Configuration driving HMGenS. Window files are referenced from the scratch
/// copy made by [`prepare_windows`].
pub fn synthesis_configuration(ctx: &Context, use_gv: bool) -> String {
    let streams = &ctx.streams;
    let mut out = String::new();
    out.push_str("NATURALREADORDER = T\n");
    out.push_str("NATURALWRITEORDER = T\n");
    out.push_str("USEALIGN = T\n");
    let _ = writeln!(out, "MAXEMITER = {}", ctx.synthesis.maxemiter);

    let sizes: Vec<String> = streams
        .iter()
        .map(|s| if s.is_msd { s.winfiles.len() } else { 1 }.to_string())
        .collect();
    let _ = writeln!(out, "PDFSTRSIZE = \"IntVec {} {}\"", streams.len(), sizes.join(" "));
    let orders: Vec<String> = streams.iter().map(|s| s.static_dim().to_string()).collect();
    let _ = writeln!(out, "PDFSTRORDER = \"IntVec {} {}\"", streams.len(), orders.join(" "));
    let exts: Vec<&str> = streams.iter().map(|s| s.kind.extension()).collect();
    let _ = writeln!(out, "PDFSTREXT = \"StrVec {} {}\"", streams.len(), exts.join(" "));

    let win_dir = ctx.scratch.win_dir();
    out.push_str("WINFN = \"");
    for stream in streams {
        let _ = write!(out, "StrVec {} ", stream.winfiles.len());
        for win in &stream.winfiles {
            let name = Path::new(win).file_name().unwrap_or_default();
            let _ = write!(out, "{} ", win_dir.join(name).display());
        }
    }
    out.push_str("\"\n");

    if use_gv {
        let gv = &ctx.synthesis.gv;
        let _ = writeln!(out, "EMEPSILON  = {:.6}", gv.emepsilon);
        out.push_str("USEGV      = TRUE\n");
        let _ = writeln!(out, "GVMODELMMF = {}", ctx.scratch.composed_model("gv").display());
        let _ = writeln!(out, "GVHMMLIST  = {}", ctx.scratch.tied_list("gv").display());
        let _ = writeln!(out, "MAXGVITER  = {}", gv.maxgviter);
        let _ = writeln!(out, "GVEPSILON  = {:.6}", gv.gvepsilon);
        let _ = writeln!(out, "MINEUCNORM = {:.6}", gv.mineucnorm);
        let _ = writeln!(out, "STEPINIT   = {:.6}", gv.stepinit);
        let _ = writeln!(out, "STEPINC    = {:.6}", gv.stepinc);
        let _ = writeln!(out, "STEPDEC    = {:.6}", gv.stepdec);
        let _ = writeln!(out, "HMMWEIGHT  = {:.6}", gv.hmmweight);
        let _ = writeln!(out, "GVWEIGHT   = {:.6}", gv.gvweight);
        let _ = writeln!(out, "OPTKIND    = {}", gv.optkind);
        if let Some(silences) = &ctx.gv_switches.silences {
            let _ = writeln!(
                out,
                "GVOFFMODEL = \"StrVec {} {}\"",
                silences.len(),
                silences.join(" ")
            );
        }
        let cdgv = if ctx.gv_switches.cdgv { "TRUE" } else { "FALSE" };
        let _ = writeln!(out, "CDGV = {cdgv}");
    } else {
        out.push_str("USEGV      = FALSE\n");
    }
    out
}

/// Replaces the scratch window directory by a fresh copy of the voice's one.
pub fn prepare_windows(ctx: &Context) -> Result<()> {
    let target = ctx.scratch.win_dir();
    if target.exists() {
        std::fs::remove_dir_all(&target)
            .with_context(|| format!("cannot clear {}", target.display()))?;
    }
    std::fs::create_dir_all(&target)?;
    let source = &ctx.models.win_dir;
    for entry in std::fs::read_dir(source)
        .with_context(|| format!("cannot list window directory {}", source.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), target.join(entry.file_name()))?;
        }
    }
    Ok(())
}

pub fn write_configurations(ctx: &Context, use_gv: bool) -> Result<()> {
    info!("Generate HTS configuration files");
    std::fs::write(ctx.scratch.train_config(), training_configuration(ctx))
        .with_context(|| format!("cannot write {}", ctx.scratch.train_config().display()))?;
    prepare_windows(ctx)?;
    std::fs::write(ctx.scratch.synth_config(), synthesis_configuration(ctx, use_gv))
        .with_context(|| format!("cannot write {}", ctx.scratch.synth_config().display()))?;
    Ok(())
}
