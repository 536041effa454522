#![forbid(unsafe_code)]

mod ping;

pub use ping::PingHandler;
