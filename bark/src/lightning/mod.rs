//! Lightning payments through the Ark server.
//!
//! The server acts as the lightning gateway. Incoming payments are held by
//! the server until we claim them with the preimage, outgoing payments are
//! funded with VTXOs that stay locked until the payment settles or fails.

mod pay;
mod receive;
