use crate::{database::ID, modeling::topology::Datacenter};
use tracing_unwrap::OptionExt;

/// A topology paired with the tick at which it takes effect.
#[derive(Debug, Clone)]
pub struct Section {
    datacenter: Datacenter,
    start_tick: u32,
}

impl Section {
    pub fn new(datacenter: Datacenter, start_tick: u32) -> Self {
        Self {
            datacenter,
            start_tick,
        }
    }

    pub fn start_tick(&self) -> u32 {
        self.start_tick
    }

    pub fn datacenter(&self) -> &Datacenter {
        &self.datacenter
    }

    pub fn datacenter_mut(&mut self) -> &mut Datacenter {
        &mut self.datacenter
    }
}

/// The sections of one experiment. Immutable after load.
#[derive(Debug, Clone)]
pub struct Path {
    id: ID,
    sections: Vec<Section>,
}

impl Path {
    pub fn new(id: ID) -> Self {
        Self {
            id,
            sections: Vec::new(),
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn add_section(&mut self, section: Section) {
        // two sections sharing a start tick means corrupt input
        assert!(
            self.sections
                .iter()
                .all(|existing| existing.start_tick() != section.start_tick()),
            "path {} has two sections starting at tick {}",
            self.id,
            section.start_tick()
        );

        self.sections.push(section);
    }

    /// The section active at `tick`: the one with the greatest start tick
    /// strictly below it, falling back to the earliest section when nothing
    /// has started yet.
    pub fn active_at(&self, tick: u32) -> &Section {
        &self.sections[self.active_index_at(tick)]
    }

    pub fn active_at_mut(&mut self, tick: u32) -> &mut Section {
        let index = self.active_index_at(tick);
        &mut self.sections[index]
    }

    fn active_index_at(&self, tick: u32) -> usize {
        let mut active: Option<usize> = None;

        for (index, section) in self.sections.iter().enumerate() {
            if section.start_tick() >= tick {
                continue;
            }

            if active.map_or(true, |current| {
                self.sections[current].start_tick() < section.start_tick()
            }) {
                active = Some(index);
            }
        }

        active.unwrap_or_else(|| {
            self.sections
                .iter()
                .enumerate()
                .min_by_key(|(_, section)| section.start_tick())
                .map(|(index, _)| index)
                .expect_or_log("path holds no sections")
        })
    }
}
