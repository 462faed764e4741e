pub mod codec;
pub mod device;
pub mod loopback;
pub mod mixer;
pub mod noise;
pub mod pipeline;
pub mod playback;
pub mod silence;
pub mod spectrum;
