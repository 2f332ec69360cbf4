/// Shader stage a routine is compiled for. Stage-specific leaf behavior is
/// selected by this tag rather than by separate compiler types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pixel,
    Vertex,
}

impl Stage {
    /// Only pixel routines may kill lanes.
    pub fn allows_discard(self) -> bool {
        matches!(self, Stage::Pixel)
    }

    pub fn id(self) -> u8 {
        match self {
            Stage::Pixel => 0,
            Stage::Vertex => 1,
        }
    }
}
