//! Generational storage of render layers
//!
//! Layers are referenced from outside the backend through [`LayerId`]s. Freeing a layer bumps
//! the generation of its slot, so stale ids of reconfigured outputs never alias a newer layer.

use crate::backend::renderer::LayerId;

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena owning the layers of a backend
#[derive(Debug)]
pub struct LayerArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> Default for LayerArena<T> {
    fn default() -> Self {
        LayerArena {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> LayerArena<T> {
    /// Create an empty arena
    pub fn new() -> LayerArena<T> {
        LayerArena::default()
    }

    /// Store a layer, reusing a freed slot if possible
    pub fn insert(&mut self, value: T) -> LayerId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return LayerId {
                index,
                generation: entry.generation,
            };
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        LayerId { index, generation: 0 }
    }

    /// Access a layer, `None` if it was freed
    pub fn get(&self, id: LayerId) -> Option<&T> {
        self.entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Mutably access a layer, `None` if it was freed
    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    /// Free a layer
    pub fn remove(&mut self, id: LayerId) -> Option<T> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(value)
    }

    /// Number of live layers
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Whether no layer is alive
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate mutably over all live layers
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().filter_map(|entry| entry.value.as_mut())
    }
}
