//! Panel layout for multi-line figures, plus the rendering collaborator
//! contract. Actual drawing lives outside this crate; the toolkit only
//! decides which spectrum goes into which panel.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::spectrum::Spectrum;
use crate::error::{Error, Result};
use crate::fit::ammonia::Nh3Line;

/// One panel of a figure grid, matplotlib-style: `index` is 1-based,
/// row-major over a `rows` x `cols` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PanelSlot {
    pub rows: usize,
    pub cols: usize,
    pub index: usize,
}

impl PanelSlot {
    const fn new(rows: usize, cols: usize, index: usize) -> Self {
        PanelSlot { rows, cols, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPolicy {
    /// The historical lookup table. At three lines the three-three and
    /// four-four names share the bottom-right slot; kept as-is because
    /// existing figures depend on it.
    FixedTable,
    /// Layout derived from the actual line set; slots are distinct by
    /// construction.
    Computed,
}

/// External rendering collaborator: gets a panel, a title, and the
/// spectrum (with its fit record); returns nothing the toolkit consumes.
pub trait PanelRenderer {
    fn draw(&mut self, slot: PanelSlot, title: &str, spectrum: &Spectrum) -> anyhow::Result<()>;
}

/// Assign a panel to each line. Layouts exist for two to four lines.
pub fn panel_layout(
    lines: &[Nh3Line],
    policy: LayoutPolicy,
) -> Result<BTreeMap<Nh3Line, PanelSlot>> {
    let mut sorted: Vec<Nh3Line> = lines.to_vec();
    sorted.sort();
    sorted.dedup();
    let n = sorted.len();
    if !(2..=4).contains(&n) {
        return Err(Error::PanelLayout(n));
    }

    let mut layout = BTreeMap::new();
    match policy {
        LayoutPolicy::FixedTable => {
            for &line in &sorted {
                let slot = fixed_slot(line, n).ok_or(Error::PanelSlotUnassigned {
                    line,
                    count: n,
                })?;
                layout.insert(line, slot);
            }
        }
        LayoutPolicy::Computed => {
            let slots: &[PanelSlot] = match n {
                2 => &[PanelSlot::new(2, 1, 1), PanelSlot::new(2, 1, 2)],
                3 => &[
                    PanelSlot::new(2, 1, 1),
                    PanelSlot::new(2, 2, 3),
                    PanelSlot::new(2, 2, 4),
                ],
                _ => &[
                    PanelSlot::new(2, 2, 1),
                    PanelSlot::new(2, 2, 2),
                    PanelSlot::new(2, 2, 3),
                    PanelSlot::new(2, 2, 4),
                ],
            };
            for (&line, &slot) in sorted.iter().zip(slots) {
                layout.insert(line, slot);
            }
        }
    }
    Ok(layout)
}

fn fixed_slot(line: Nh3Line, count: usize) -> Option<PanelSlot> {
    match count {
        2 => match line {
            Nh3Line::OneOne => Some(PanelSlot::new(2, 1, 1)),
            Nh3Line::TwoTwo => Some(PanelSlot::new(2, 1, 2)),
            _ => None,
        },
        3 => match line {
            Nh3Line::OneOne => Some(PanelSlot::new(2, 1, 1)),
            Nh3Line::TwoTwo => Some(PanelSlot::new(2, 2, 3)),
            // Both remaining names land on the same slot in the
            // historical table.
            Nh3Line::ThreeThree | Nh3Line::FourFour => Some(PanelSlot::new(2, 2, 4)),
        },
        4 => match line {
            Nh3Line::OneOne => Some(PanelSlot::new(2, 2, 1)),
            Nh3Line::TwoTwo => Some(PanelSlot::new(2, 2, 2)),
            Nh3Line::ThreeThree => Some(PanelSlot::new(2, 2, 3)),
            Nh3Line::FourFour => Some(PanelSlot::new(2, 2, 4)),
        },
        _ => None,
    }
}

/// Drive the renderer over every line, in canonical line order.
pub fn render_lines(
    lines: &BTreeMap<Nh3Line, Spectrum>,
    renderer: &mut dyn PanelRenderer,
    policy: LayoutPolicy,
) -> Result<()> {
    let names: Vec<Nh3Line> = lines.keys().copied().collect();
    let layout = panel_layout(&names, policy)?;
    for (line, spectrum) in lines {
        let slot = layout[line];
        renderer
            .draw(slot, &line.to_string(), spectrum)
            .map_err(Error::Render)?;
    }
    Ok(())
}
