/// Stand-in for the bar visualizer shown next to each player.  Only the
/// on/off state matters to the controllers; drawing happens in the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Visualizer {
    active: bool,
}

impl Visualizer {
    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}
