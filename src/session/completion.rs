//! Decides when an agent reply ends the call.

/// Marker phrases that together signal a finished conversation.
///
/// A reply ends the call only when it contains at least one farewell
/// marker and at least one well-being marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPolicy {
    pub farewell: Vec<String>,
    pub wellbeing: Vec<String>,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            farewell: vec!["thanks for calling".into(), "thank you for calling".into()],
            wellbeing: vec!["have a great day".into(), "have a good day".into()],
        }
    }
}

impl CompletionPolicy {
    pub fn is_complete(&self, reply: &str) -> bool {
        let lower = reply.to_lowercase();
        let has = |markers: &[String]| markers.iter().any(|m| lower.contains(&m.to_lowercase()));
        has(&self.farewell) && has(&self.wellbeing)
    }
}
