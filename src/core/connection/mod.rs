pub mod crypto;
pub mod webrtc;
