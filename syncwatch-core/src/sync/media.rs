//! Media element abstraction

/// The playback surface the coordinator drives. Positions are in seconds.
pub trait MediaPlayer: Send {
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn playback_rate(&self) -> f64;
    /// Seconds of media buffered ahead of the current position
    fn buffered_ahead(&self) -> f64;

    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    fn set_playback_rate(&mut self, rate: f64);
}
