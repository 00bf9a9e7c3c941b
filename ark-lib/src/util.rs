
use bitcoin::{opcodes, ScriptBuf};
use bitcoin::secp256k1::{self, PublicKey, XOnlyPublicKey};

lazy_static! {
	/// Global secp context.
	pub static ref SECP: secp256k1::Secp256k1<secp256k1::All> = secp256k1::Secp256k1::new();
}

/// Create a tapscript that is a checksig and a relative timelock.
pub fn delayed_sign(delay_blocks: u16, pubkey: XOnlyPublicKey) -> ScriptBuf {
	let csv = bitcoin::Sequence::from_height(delay_blocks);
	bitcoin::Script::builder()
		.push_int(csv.to_consensus_u32() as i64)
		.push_opcode(opcodes::all::OP_CSV)
		.push_opcode(opcodes::all::OP_DROP)
		.push_x_only_key(&pubkey)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// Create a tapscript that requires signatures of both keys.
pub fn multisig_2of2(first: XOnlyPublicKey, second: XOnlyPublicKey) -> ScriptBuf {
	bitcoin::Script::builder()
		.push_x_only_key(&first)
		.push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
		.push_x_only_key(&second)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// The taproot internal key shared by the user and the server.
///
/// This is the point sum of both keys. Neither party can produce a
/// keyspend signature for it alone.
pub fn combine_keys(user: PublicKey, server: PublicKey) -> XOnlyPublicKey {
	user.combine(&server).expect("keys are not each other's negation").x_only_public_key().0
}
