//! Reference sender/receiver agents and games used by the binary and tests:
//! a synthetic symbol dataset, small MLP agents, and a Gumbel-Softmax and a
//! REINFORCE game built from them.

pub mod data;
pub mod games;
pub mod networks;

pub use data::{one_hot, DataConfig, SymbolBatch, SymbolDataset};
pub use games::{gs_game, rf_game, GameConfig, GsGame, RfGame};
pub use networks::{Receiver, ReceiverConfig, ReceiverWrapper, Sender, SenderConfig};
