use crate::camera::Matrix44;

/// Output of one tracker call.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerResult {
    /// Name of the tracker that produced this result.
    pub tracker: String,
    pub targets: Vec<TargetInstance>,
}

impl TrackerResult {
    /// Instances currently being tracked (not merely detected).
    pub fn tracked(&self) -> impl Iterator<Item = &TargetInstance> {
        self.targets
            .iter()
            .filter(|instance| instance.status == TargetStatus::Tracked)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetInstance {
    pub target: String,
    pub runtime_id: u32,
    pub status: TargetStatus,
    /// Physical width of the target in scene units.
    pub scale: f32,
    /// Target pose in camera space (row-major, translation in the last column).
    pub pose: Matrix44,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TargetStatus {
    #[default]
    Unknown,
    Undefined,
    Detected,
    Tracked,
}
