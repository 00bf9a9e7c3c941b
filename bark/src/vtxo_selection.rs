
use std::collections::HashSet;

use bitcoin::Amount;
use log::warn;

use ark::VtxoId;
use bitcoin_ext::BlockHeight;

use crate::Error;
use crate::vtxo_state::{VtxoState, WalletVtxo};


/// Trait needed to be implemented to filter wallet VTXOs.
///
/// See [crate::Wallet::vtxos_with]. For easy filtering, see [VtxoFilter].
///
/// This trait is also implemented for `Fn(&WalletVtxo) -> bool`.
pub trait FilterVtxos {
	fn filter(&self, vtxos: Vec<WalletVtxo>) -> Vec<WalletVtxo>;
}

impl<F> FilterVtxos for F
where
	F: Fn(&WalletVtxo) -> bool,
{
	fn filter(&self, mut vtxos: Vec<WalletVtxo>) -> Vec<WalletVtxo> {
		vtxos.retain(|v| self(v));
		vtxos
	}
}

/// Filter vtxos based on criteria.
///
/// Builder pattern is used. Explicit includes and excludes take precedence,
/// otherwise a VTXO must match every criterion that was set.
#[derive(Debug, Clone, Default)]
pub struct VtxoFilter {
	/// Only vtxos that expire before the given height.
	pub expires_before: Option<BlockHeight>,
	/// Only vtxos in the given state.
	pub state: Option<VtxoState>,
	/// Only vtxos received out-of-round.
	pub arkoor_only: bool,
	/// Exclude certain vtxos.
	pub exclude: HashSet<VtxoId>,
	/// Force include certain vtxos.
	pub include: HashSet<VtxoId>,
}

impl VtxoFilter {
	pub fn new() -> VtxoFilter {
		VtxoFilter::default()
	}

	fn matches(&self, vtxo: &WalletVtxo) -> bool {
		let id = vtxo.id();

		// First do explicit includes and excludes.
		if self.include.contains(&id) {
			return true;
		}
		if self.exclude.contains(&id) {
			return false;
		}

		if let Some(height) = self.expires_before {
			if vtxo.expiry_height >= height {
				return false;
			}
		}

		if let Some(state) = self.state {
			if vtxo.state != state {
				return false;
			}
		}

		if self.arkoor_only && !vtxo.is_arkoor {
			return false;
		}

		true
	}

	/// Include vtxos that expire before the given height.
	pub fn expires_before(mut self, expires_before: BlockHeight) -> Self {
		self.expires_before = Some(expires_before);
		self
	}

	/// Include vtxos in the given state.
	pub fn state(mut self, state: VtxoState) -> Self {
		self.state = Some(state);
		self
	}

	/// Include only vtxos received out-of-round.
	pub fn arkoor_only(mut self) -> Self {
		self.arkoor_only = true;
		self
	}

	/// Exclude the given vtxo.
	pub fn exclude(mut self, exclude: VtxoId) -> Self {
		self.exclude.insert(exclude);
		self
	}

	/// Exclude the given vtxos.
	pub fn exclude_many(mut self, exclude: impl IntoIterator<Item = VtxoId>) -> Self {
		self.exclude.extend(exclude);
		self
	}

	/// Include the given vtxo.
	pub fn include(mut self, include: VtxoId) -> Self {
		self.include.insert(include);
		self
	}

	/// Include the given vtxos.
	pub fn include_many(mut self, include: impl IntoIterator<Item = VtxoId>) -> Self {
		self.include.extend(include);
		self
	}
}

impl FilterVtxos for VtxoFilter {
	fn filter(&self, mut vtxos: Vec<WalletVtxo>) -> Vec<WalletVtxo> {
		vtxos.retain(|v| self.matches(v));
		vtxos
	}
}

/// Selects the VTXOs that are due for a refresh.
pub struct RefreshStrategy {
	tip: BlockHeight,
	threshold: BlockHeight,
}

impl RefreshStrategy {
	/// VTXOs that expire within `threshold` blocks of `tip` must be refreshed.
	///
	/// VTXOs that already expired can't be refreshed anymore and are left
	/// for the exit engine.
	pub fn must_refresh(tip: BlockHeight, threshold: BlockHeight) -> Self {
		RefreshStrategy { tip, threshold }
	}
}

impl FilterVtxos for RefreshStrategy {
	fn filter(&self, mut vtxos: Vec<WalletVtxo>) -> Vec<WalletVtxo> {
		vtxos.retain(|vtxo| {
			if vtxo.state != VtxoState::Spendable || vtxo.is_expired(self.tip) {
				return false;
			}
			if self.tip > vtxo.expiry_height.saturating_sub(self.threshold) {
				warn!("VTXO {} is about to expire soon, must be refreshed", vtxo.id());
				return true;
			}
			false
		});
		vtxos
	}
}

/// The result of [select_vtxos].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtxoSelection {
	pub inputs: Vec<WalletVtxo>,
	/// Amount to return to ourselves, [None] when the surplus was below dust.
	pub change: Option<Amount>,
	/// Surplus below dust that is donated as fee.
	pub dust_fee: Amount,
}

impl VtxoSelection {
	pub fn input_amount(&self) -> Amount {
		self.inputs.iter().map(|v| v.amount()).sum()
	}

	pub fn input_ids(&self) -> Vec<VtxoId> {
		self.inputs.iter().map(|v| v.id()).collect()
	}
}

/// Select VTXOs to cover `amount`.
///
/// VTXOs that expire first are spent first and among those with the same
/// expiry, larger ones are preferred. A surplus below `dust` is not worth a
/// change output and goes to fees.
pub fn select_vtxos(
	mut candidates: Vec<WalletVtxo>,
	amount: Amount,
	dust: Amount,
) -> Result<VtxoSelection, Error> {
	candidates.sort_by(|a, b| {
		a.expiry_height.cmp(&b.expiry_height).then(b.amount().cmp(&a.amount()))
	});

	let available = candidates.iter().map(|v| v.amount()).sum::<Amount>();
	let mut inputs = Vec::new();
	let mut total = Amount::ZERO;
	for vtxo in candidates {
		if total >= amount {
			break;
		}
		total += vtxo.amount();
		inputs.push(vtxo);
	}

	if total < amount || inputs.is_empty() {
		return Err(Error::InsufficientFunds { needed: amount, available });
	}

	let surplus = total - amount;
	let (change, dust_fee) = if surplus >= dust && surplus > Amount::ZERO {
		(Some(surplus), Amount::ZERO)
	} else {
		(None, surplus)
	};
	Ok(VtxoSelection { inputs, change, dust_fee })
}

#[cfg(test)]
mod test {
	use super::*;

	use ark::test::dummy::{dummy_outpoint, dummy_user_keypair, DummyServer};

	fn wallet_vtxo(idx: u32, amount: u64, expiry: BlockHeight, state: VtxoState) -> WalletVtxo {
		let server = DummyServer::new();
		let user = dummy_user_keypair().public_key();
		WalletVtxo {
			vtxo: server.issue(user, Amount::from_sat(amount), expiry, dummy_outpoint(idx), false),
			state,
		}
	}

	#[test]
	fn expiring_first() {
		let vtxos = vec![
			wallet_vtxo(1, 500, 100, VtxoState::Spendable),
			wallet_vtxo(2, 700, 50, VtxoState::Spendable),
			wallet_vtxo(3, 2000, 200, VtxoState::Spendable),
		];
		let amount = Amount::from_sat(1000);

		let sel = select_vtxos(vtxos.clone(), amount, Amount::from_sat(330)).unwrap();
		assert_eq!(sel.input_ids(), vec![vtxos[1].id(), vtxos[0].id()]);
		assert_eq!(sel.change, None);
		assert_eq!(sel.dust_fee, Amount::from_sat(200));

		let sel = select_vtxos(vtxos.clone(), amount, Amount::from_sat(200)).unwrap();
		assert_eq!(sel.change, Some(Amount::from_sat(200)));
		assert_eq!(sel.dust_fee, Amount::ZERO);
		assert_eq!(sel.input_amount(), amount + Amount::from_sat(200));
	}

	#[test]
	fn larger_first_on_equal_expiry() {
		let vtxos = vec![
			wallet_vtxo(1, 500, 100, VtxoState::Spendable),
			wallet_vtxo(2, 900, 100, VtxoState::Spendable),
		];
		let sel = select_vtxos(vtxos.clone(), Amount::from_sat(800), Amount::ZERO).unwrap();
		assert_eq!(sel.input_ids(), vec![vtxos[1].id()]);
		assert_eq!(sel.change, Some(Amount::from_sat(100)));
	}

	#[test]
	fn insufficient_funds() {
		let vtxos = vec![wallet_vtxo(1, 500, 100, VtxoState::Spendable)];
		match select_vtxos(vtxos, Amount::from_sat(501), Amount::ZERO) {
			Err(Error::InsufficientFunds { needed, available }) => {
				assert_eq!(needed, Amount::from_sat(501));
				assert_eq!(available, Amount::from_sat(500));
			},
			r => panic!("unexpected result: {:?}", r),
		}
		assert!(select_vtxos(vec![], Amount::from_sat(1), Amount::ZERO).is_err());
	}

	#[test]
	fn filter_criteria() {
		let a = wallet_vtxo(1, 500, 100, VtxoState::Spendable);
		let b = wallet_vtxo(2, 700, 50, VtxoState::Locked);
		let c = wallet_vtxo(3, 900, 300, VtxoState::Spendable);
		let all = vec![a.clone(), b.clone(), c.clone()];

		let res = VtxoFilter::new().state(VtxoState::Spendable).filter(all.clone());
		assert_eq!(res, vec![a.clone(), c.clone()]);

		let res = VtxoFilter::new().expires_before(200).filter(all.clone());
		assert_eq!(res, vec![a.clone(), b.clone()]);

		let res = VtxoFilter::new().expires_before(200).include(c.id()).exclude(a.id()).filter(all.clone());
		assert_eq!(res, vec![b.clone(), c.clone()]);

		assert!(VtxoFilter::new().arkoor_only().filter(all.clone()).is_empty());
	}

	#[test]
	fn refresh_threshold() {
		let soon = wallet_vtxo(1, 500, 110, VtxoState::Spendable);
		let later = wallet_vtxo(2, 500, 1000, VtxoState::Spendable);
		let expired = wallet_vtxo(3, 500, 90, VtxoState::Spendable);
		let locked = wallet_vtxo(4, 500, 110, VtxoState::Locked);

		let res = RefreshStrategy::must_refresh(100, 288)
			.filter(vec![soon.clone(), later, expired, locked]);
		assert_eq!(res, vec![soon]);
	}
}
