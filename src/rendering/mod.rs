//! Generated streams to the final artefacts: waveforms, EMA JSON, or both.

pub mod conversion;
pub mod ema;
pub mod straight;
pub mod weight;
pub mod world;

use crate::config::RendererKind;
use crate::stage::StageRunner;
use crate::worker_pool::Ledger;
use anyhow::Result;
use ema::EmaRenderer;
use straight::StraightRenderer;
use weight::WeightRenderer;
use world::WorldRenderer;

/// STRAIGHT audio plus EMA JSON from the same generated streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightEmaRenderer {
    straight: StraightRenderer,
    ema: EmaRenderer,
}

impl StraightEmaRenderer {
    pub fn render(&self, runner: &StageRunner<'_>, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        // conversion leaves the `ema` stream in place
        self.straight.render(runner, bases, ledger)?;
        self.ema.render(runner, bases, ledger)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Renderer {
    Straight(StraightRenderer),
    World(WorldRenderer),
    Ema(EmaRenderer),
    Weight(WeightRenderer),
    StraightEma(StraightEmaRenderer),
}

impl Renderer {
    pub fn from_kind(kind: RendererKind) -> Self {
        match kind {
            RendererKind::Straight => Renderer::Straight(StraightRenderer),
            RendererKind::World(_) => Renderer::World(WorldRenderer),
            RendererKind::Ema => Renderer::Ema(EmaRenderer),
            RendererKind::Weight => Renderer::Weight(WeightRenderer),
            RendererKind::StraightEma => Renderer::StraightEma(StraightEmaRenderer::default()),
        }
    }

    pub fn render(&self, runner: &StageRunner<'_>, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        match self {
            Renderer::Straight(r) => r.render(runner, bases, ledger),
            Renderer::World(r) => r.render(runner, bases, ledger),
            Renderer::Ema(r) => r.render(runner, bases, ledger),
            Renderer::Weight(r) => r.render(runner, bases, ledger),
            Renderer::StraightEma(r) => r.render(runner, bases, ledger),
        }
    }
}
