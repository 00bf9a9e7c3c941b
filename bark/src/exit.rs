//! Unilateral exit of VTXOs.
//!
//! Every exit is driven by a small state machine, see [ExitState]. Each
//! call to [Wallet::progress_exits] moves every exit at most one step, so
//! the exit engine is driven by calling [Wallet::maintenance] regularly.

use anyhow::Context;
use bitcoin::Amount;

use bark_json::cli::{ExitProgressStatus, ExitStatus, MovementKind};
use bark_json::exit::ExitState;
use bitcoin_ext::{BlockHeight, TxStatus};

use crate::{Error, Wallet, WalletVtxo};
use crate::movement::NewMovement;
use crate::onchain::ExitUtxo;
use crate::persist::{StagedChanges, StoredExit};
use crate::vtxo_state::VtxoState;

impl Wallet {
	/// Start the exit of all VTXOs matching `filter`.
	///
	/// Only spendable VTXOs and boards can be exited, VTXOs locked in other
	/// operations are left alone. Returns the number of exits started.
	///
	/// The [MovementKind::Exit] movement records the exited amount as sent:
	/// it leaves the off-chain balance, is counted as pending exit until the
	/// exit is swept and then shows up in the on-chain balance.
	pub(crate) fn start_exits(&self, filter: impl Fn(&WalletVtxo) -> bool) -> anyhow::Result<usize> {
		self.with_writer(|db| {
			let vtxos = db.get_all_vtxos()?.into_iter()
				.filter(|v| matches!(v.state, VtxoState::Spendable | VtxoState::PendingBoard))
				.filter(|v| filter(v))
				.collect::<Vec<_>>();
			if vtxos.is_empty() {
				return Ok(0);
			}

			let total = vtxos.iter().map(|v| v.amount()).sum::<Amount>();
			let mut changes = StagedChanges::new();
			changes.update_state(
				vtxos.iter().map(|v| v.id()),
				VtxoState::Exiting,
				&[VtxoState::Spendable, VtxoState::PendingBoard],
			);
			for vtxo in &vtxos {
				info!("Starting exit of vtxo {}", vtxo.id());
				changes.store_exit(StoredExit {
					vtxo: vtxo.vtxo.clone(),
					state: ExitState::new_requested(),
				});
			}
			changes.add_movement(NewMovement::new(MovementKind::Exit).sent(total));
			db.commit(&changes)?;
			Ok(vtxos.len())
		})
	}

	/// Exit all VTXOs of the wallet on-chain.
	///
	/// Every spendable VTXO is exited, expired or not, and so are boards
	/// that were broadcast but never registered with the server. VTXOs
	/// locked in a running operation are not. The exit is started and
	/// driven one step, call [Wallet::maintenance] to drive it further.
	pub async fn exit_all(&self) -> Result<(), Error> {
		let started = self.start_exits(|v| {
			matches!(v.state, VtxoState::Spendable | VtxoState::PendingBoard)
		})?;
		info!("Started exit of {} vtxos", started);
		self.progress_exits().await?;
		Ok(())
	}

	/// The progress of all exits of the wallet.
	pub fn exit_status(&self) -> Result<ExitStatus, Error> {
		let exits = self.db.get_exits()?;
		if exits.is_empty() {
			return Ok(ExitStatus::default());
		}

		let done = exits.iter().all(|e| !e.state.is_pending());
		let height = exits.iter()
			.map(|e| e.state.confirmed_height())
			.collect::<Option<Vec<BlockHeight>>>()
			.and_then(|heights| heights.into_iter().max());
		Ok(ExitStatus {
			done,
			height,
			exits: exits.into_iter().map(|e| ExitProgressStatus {
				vtxo_id: e.id(),
				state: e.state,
			}).collect(),
		})
	}

	/// Move every pending exit at most one step forward.
	pub(crate) async fn progress_exits(&self) -> anyhow::Result<()> {
		let exits = self.db.get_exits()?.into_iter()
			.filter(|e| e.state.is_pending())
			.collect::<Vec<_>>();
		if exits.is_empty() {
			return Ok(());
		}

		let tip = self.chain.tip().await.context("failed to fetch chain tip")?;
		for exit in exits {
			match self.next_exit_state(&exit, tip).await {
				Ok(Some(state)) => self.store_exit_state(exit, state)?,
				Ok(None) => trace!("Exit of vtxo {} is {}", exit.id(), exit.state.kind()),
				Err(e) => error!("Failed to progress exit of vtxo {}: {:#}", exit.id(), e),
			}
		}
		Ok(())
	}

	fn store_exit_state(&self, exit: StoredExit, state: ExitState) -> anyhow::Result<()> {
		let id = exit.id();
		info!("Exit of vtxo {} is now {}", id, state.kind());
		if let ExitState::Stalled { ref reason } = state {
			warn!("Exit of vtxo {} stalled: {}", id, reason);
		}

		let mut changes = StagedChanges::new();
		if let ExitState::Swept { confirmed_height } = state {
			changes.remove_vtxos([id]);
			changes.add_exit_utxo(ExitUtxo {
				vtxo: exit.vtxo.clone(),
				height: confirmed_height,
			});
		}
		changes.store_exit(StoredExit { vtxo: exit.vtxo, state });
		self.commit(&changes)?;
		Ok(())
	}

	/// The state the exit moves to, if it moves.
	async fn next_exit_state(
		&self,
		exit: &StoredExit,
		tip: BlockHeight,
	) -> anyhow::Result<Option<ExitState>> {
		let exit_txid = exit.vtxo.point.txid;
		let next = match exit.state {
			ExitState::Requested | ExitState::Stalled { .. } => {
				for tx in &exit.vtxo.exit_branch {
					let txid = tx.compute_txid();
					if self.chain.tx_status(txid).await?.is_known() {
						continue;
					}
					if let Err(e) = self.chain.broadcast_tx(tx).await {
						let stalled = ExitState::new_stalled(
							format!("failed to broadcast exit tx {}: {:#}", txid, e),
						);
						return Ok(Some(stalled).filter(|s| *s != exit.state));
					}
					debug!("Broadcast exit tx {}", txid);
				}
				ExitState::new_broadcast(tip)
			},
			ExitState::Broadcast { height } => match self.chain.tx_status(exit_txid).await? {
				TxStatus::Confirmed(h) => ExitState::new_confirming(h),
				TxStatus::Mempool if tip >= height + self.config.exit_stall_window as BlockHeight => {
					ExitState::new_stalled(format!(
						"exit tx {} unconfirmed after {} blocks", exit_txid, tip - height,
					))
				},
				TxStatus::Mempool => return Ok(None),
				TxStatus::NotFound => {
					ExitState::new_stalled(format!("exit tx {} disappeared", exit_txid))
				},
			},
			ExitState::Confirming { confirmed_height } => {
				match self.chain.tx_status(exit_txid).await? {
					TxStatus::Confirmed(h) if h != confirmed_height => ExitState::new_confirming(h),
					TxStatus::Confirmed(_) => {
						match exit.state.spendable_height(exit.vtxo.exit_delta) {
							Some(h) if tip >= h => ExitState::new_swept(confirmed_height),
							_ => return Ok(None),
						}
					},
					TxStatus::Mempool | TxStatus::NotFound => {
						ExitState::new_stalled(format!("exit tx {} is no longer confirmed", exit_txid))
					},
				}
			},
			ExitState::Swept { .. } => return Ok(None),
		};
		Ok(Some(next))
	}
}
