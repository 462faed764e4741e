mod state;

pub use state::RoomState;
