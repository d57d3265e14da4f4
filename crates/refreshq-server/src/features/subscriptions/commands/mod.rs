pub mod track;

pub use track::TrackSubscriptionCommand;
