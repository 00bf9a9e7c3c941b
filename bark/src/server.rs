//! The wallet's view of the Ark server.
//!
//! All interaction with the ASP goes through the [ArkServer] trait so that
//! the transport can be swapped. [HttpArkClient] speaks JSON over HTTP.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, Transaction, Txid};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{schnorr, Keypair, Message, PublicKey};
use lightning_invoice::Bolt11Invoice;
use log::{debug, trace};
use serde::Serialize;
use serde::de::DeserializeOwned;

use ark::{ArkInfo, OffboardRequest, Vtxo, VtxoId, VtxoRequest};
use ark::lightning::{PaymentHash, Preimage};
use ark::util::SECP;

use crate::Error;

const ROUND_CHALLENGE_TAG: &str = "ark/round/participation";
const ARKOOR_CHALLENGE_TAG: &str = "ark/arkoor/cosign";
const LIGHTNING_PAY_CHALLENGE_TAG: &str = "ark/lightning/pay";

/// Errors talking to the Ark server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
	/// The server could not be reached or failed before answering. The
	/// request may or may not have been processed. This is never fatal for
	/// the wallet.
	#[error("ark server unreachable: {0}")]
	Unreachable(String),
	/// The server understood the request but refused it.
	#[error("request rejected by ark server: {0}")]
	Rejected(String),
	/// The server responded with something we can't make sense of.
	#[error("invalid response from ark server: {0}")]
	InvalidResponse(String),
}

impl From<ServerError> for Error {
	fn from(e: ServerError) -> Error {
		match e {
			ServerError::Unreachable(m) => Error::AspUnreachable(m),
			ServerError::Rejected(m) => Error::BarkFailed(format!("request rejected by ark server: {}", m)),
			ServerError::InvalidResponse(m) => Error::ProtocolError(m),
		}
	}
}

impl From<reqwest::Error> for ServerError {
	fn from(e: reqwest::Error) -> ServerError {
		if e.is_decode() {
			ServerError::InvalidResponse(e.to_string())
		} else {
			ServerError::Unreachable(e.to_string())
		}
	}
}

/// The message the owner of each input signs to authorize a request.
///
/// Commits to the tag and the JSON encoding of the request.
pub fn challenge<T: Serialize + ?Sized>(tag: &str, body: &T) -> anyhow::Result<Message> {
	let bytes = serde_json::to_vec(body).context("failed to serialize request")?;
	let tag_hash = sha256::Hash::hash(tag.as_bytes());
	let mut engine = sha256::Hash::engine();
	engine.input(tag_hash.as_byte_array());
	engine.input(tag_hash.as_byte_array());
	engine.input(&bytes);
	Ok(Message::from_digest(sha256::Hash::from_engine(engine).to_byte_array()))
}

/// A request that spends VTXOs must be signed by the owner of each input.
pub trait InputRequest: Serialize {
	const CHALLENGE_TAG: &'static str;

	fn inputs(&self) -> &[Vtxo];

	fn challenge(&self) -> anyhow::Result<Message> {
		challenge(Self::CHALLENGE_TAG, self)
	}
}

/// A request together with one signature per input, in the order of the inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed<T> {
	pub request: T,
	pub input_signatures: Vec<schnorr::Signature>,
}

impl<T: InputRequest> Signed<T> {
	/// Sign the request with the keys of the inputs, in order.
	pub fn sign(request: T, keys: &[Keypair]) -> anyhow::Result<Signed<T>> {
		if keys.len() != request.inputs().len() {
			bail!("need one key per input");
		}
		let msg = request.challenge()?;
		let input_signatures = keys.iter()
			.map(|k| SECP.sign_schnorr_no_aux_rand(&msg, k))
			.collect();
		Ok(Signed { request, input_signatures })
	}

	/// Check that every input is signed by its owner.
	pub fn verify(&self) -> anyhow::Result<()> {
		let inputs = self.request.inputs();
		if inputs.len() != self.input_signatures.len() {
			bail!("expected {} signatures, got {}", inputs.len(), self.input_signatures.len());
		}
		let msg = self.request.challenge()?;
		for (vtxo, sig) in inputs.iter().zip(&self.input_signatures) {
			let pk = vtxo.user_pubkey.x_only_public_key().0;
			SECP.verify_schnorr(sig, &msg, &pk)
				.with_context(|| format!("invalid signature for input {}", vtxo.id()))?;
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCosignRequest {
	pub user_pubkey: PublicKey,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	/// The output of the funding tx that pays to the board script.
	pub utxo: OutPoint,
	/// The signed funding tx.
	pub funding_tx: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundParticipation {
	pub inputs: Vec<Vtxo>,
	pub vtxo_requests: Vec<VtxoRequest>,
	pub offboard_requests: Vec<OffboardRequest>,
}

impl InputRequest for RoundParticipation {
	const CHALLENGE_TAG: &'static str = ROUND_CHALLENGE_TAG;
	fn inputs(&self) -> &[Vtxo] { &self.inputs }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
	pub round_txid: Txid,
	/// The new VTXOs, in the order of the requests.
	pub vtxos: Vec<Vtxo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArkoorRequest {
	pub inputs: Vec<Vtxo>,
	pub outputs: Vec<VtxoRequest>,
}

impl InputRequest for ArkoorRequest {
	const CHALLENGE_TAG: &'static str = ARKOOR_CHALLENGE_TAG;
	fn inputs(&self) -> &[Vtxo] { &self.inputs }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningReceiveRequest {
	pub payment_hash: PaymentHash,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningClaimRequest {
	pub payment_hash: PaymentHash,
	pub preimage: Preimage,
	pub user_pubkey: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningPayRequest {
	pub invoice: Bolt11Invoice,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub inputs: Vec<Vtxo>,
	pub change: Option<VtxoRequest>,
}

impl InputRequest for LightningPayRequest {
	const CHALLENGE_TAG: &'static str = LIGHTNING_PAY_CHALLENGE_TAG;
	fn inputs(&self) -> &[Vtxo] { &self.inputs }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum LightningPayStatus {
	Succeeded {
		preimage: Preimage,
		change: Option<Vtxo>,
	},
	/// The payment definitely failed, the inputs are not spent.
	Failed {
		reason: String,
	},
	Pending,
}

#[async_trait]
pub trait ArkServer: Send + Sync + 'static {
	async fn ark_info(&self) -> Result<ArkInfo, ServerError>;

	/// Ask the server to cosign the exit branch of a new board.
	async fn board_cosign(&self, req: BoardCosignRequest) -> Result<Vtxo, ServerError>;

	/// Register a board whose funding tx was broadcast.
	async fn register_board(&self, vtxo_id: VtxoId) -> Result<(), ServerError>;

	async fn participate_round(&self, req: Signed<RoundParticipation>) -> Result<RoundResult, ServerError>;

	/// Returns the new VTXOs in the order of the requested outputs.
	async fn arkoor_cosign(&self, req: Signed<ArkoorRequest>) -> Result<Vec<Vtxo>, ServerError>;

	async fn post_mailbox(&self, vtxos: Vec<Vtxo>) -> Result<(), ServerError>;

	/// Fetch arkoor VTXOs sent to any of the given keys.
	async fn fetch_mailbox(&self, pubkeys: Vec<PublicKey>) -> Result<Vec<Vtxo>, ServerError>;

	async fn start_lightning_receive(&self, req: LightningReceiveRequest) -> Result<Bolt11Invoice, ServerError>;

	async fn claim_lightning_receive(&self, req: LightningClaimRequest) -> Result<Vtxo, ServerError>;

	async fn pay_bolt11(&self, req: Signed<LightningPayRequest>) -> Result<LightningPayStatus, ServerError>;

	async fn check_bolt11_payment(&self, payment_hash: PaymentHash) -> Result<LightningPayStatus, ServerError>;

	/// Which of the given VTXOs the server considers spent.
	async fn spent_vtxos(&self, vtxo_ids: Vec<VtxoId>) -> Result<Vec<VtxoId>, ServerError>;
}

/// [ArkServer] implementation using JSON over HTTP.
pub struct HttpArkClient {
	client: reqwest::Client,
	base_url: String,
}

impl HttpArkClient {
	pub fn new(url: &str) -> anyhow::Result<HttpArkClient> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(60))
			.build()
			.context("failed to create http client")?;
		Ok(HttpArkClient {
			client,
			base_url: url.trim_end_matches('/').to_owned(),
		})
	}

	async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ServerError> {
		let status = resp.status();
		if status.is_success() {
			return Ok(resp);
		}
		let body = resp.text().await.unwrap_or_default();
		debug!("Ark server responded with {}: {}", status, body);
		Err(status_error(status, body))
	}

	async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ServerError> {
		let url = format!("{}{}", self.base_url, path);
		trace!("GET {}", url);
		let resp = self.client.get(url).send().await?;
		Ok(Self::check_status(resp).await?.json::<R>().await?)
	}

	async fn post<B: Serialize + Sync, R: DeserializeOwned>(
		&self,
		path: &str,
		body: &B,
	) -> Result<R, ServerError> {
		let url = format!("{}{}", self.base_url, path);
		trace!("POST {}", url);
		let resp = self.client.post(url).json(body).send().await?;
		Ok(Self::check_status(resp).await?.json::<R>().await?)
	}

	/// Post a request that has no meaningful response body.
	async fn post_empty<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), ServerError> {
		let url = format!("{}{}", self.base_url, path);
		trace!("POST {}", url);
		let resp = self.client.post(url).json(body).send().await?;
		Self::check_status(resp).await?;
		Ok(())
	}
}

/// Classify an unsuccessful HTTP response.
///
/// Only client errors mean the server refused the request. After a server
/// error we can't know whether the request was processed.
fn status_error(status: reqwest::StatusCode, body: String) -> ServerError {
	let msg = format!("{}: {}", status, body);
	if status.is_client_error() {
		ServerError::Rejected(msg)
	} else if status.is_server_error() {
		ServerError::Unreachable(msg)
	} else {
		ServerError::InvalidResponse(msg)
	}
}

#[derive(Serialize)]
struct VtxoIdBody {
	vtxo_id: VtxoId,
}

#[derive(Serialize, Deserialize)]
struct VtxoIdsBody {
	vtxo_ids: Vec<VtxoId>,
}

#[derive(Serialize)]
struct PubkeysBody {
	pubkeys: Vec<PublicKey>,
}

#[derive(Serialize)]
struct VtxosBody {
	vtxos: Vec<Vtxo>,
}

#[derive(Deserialize)]
struct InvoiceBody {
	invoice: Bolt11Invoice,
}

#[derive(Serialize)]
struct PaymentHashBody {
	payment_hash: PaymentHash,
}

#[async_trait]
impl ArkServer for HttpArkClient {
	async fn ark_info(&self) -> Result<ArkInfo, ServerError> {
		self.get("/v1/info").await
	}

	async fn board_cosign(&self, req: BoardCosignRequest) -> Result<Vtxo, ServerError> {
		self.post("/v1/board/cosign", &req).await
	}

	async fn register_board(&self, vtxo_id: VtxoId) -> Result<(), ServerError> {
		self.post_empty("/v1/board/register", &VtxoIdBody { vtxo_id }).await
	}

	async fn participate_round(&self, req: Signed<RoundParticipation>) -> Result<RoundResult, ServerError> {
		self.post("/v1/round/participate", &req).await
	}

	async fn arkoor_cosign(&self, req: Signed<ArkoorRequest>) -> Result<Vec<Vtxo>, ServerError> {
		self.post("/v1/arkoor/cosign", &req).await
	}

	async fn post_mailbox(&self, vtxos: Vec<Vtxo>) -> Result<(), ServerError> {
		self.post_empty("/v1/mailbox/post", &VtxosBody { vtxos }).await
	}

	async fn fetch_mailbox(&self, pubkeys: Vec<PublicKey>) -> Result<Vec<Vtxo>, ServerError> {
		self.post("/v1/mailbox/fetch", &PubkeysBody { pubkeys }).await
	}

	async fn start_lightning_receive(&self, req: LightningReceiveRequest) -> Result<Bolt11Invoice, ServerError> {
		let body: InvoiceBody = self.post("/v1/lightning/receive", &req).await?;
		Ok(body.invoice)
	}

	async fn claim_lightning_receive(&self, req: LightningClaimRequest) -> Result<Vtxo, ServerError> {
		self.post("/v1/lightning/claim", &req).await
	}

	async fn pay_bolt11(&self, req: Signed<LightningPayRequest>) -> Result<LightningPayStatus, ServerError> {
		self.post("/v1/lightning/pay", &req).await
	}

	async fn check_bolt11_payment(&self, payment_hash: PaymentHash) -> Result<LightningPayStatus, ServerError> {
		self.post("/v1/lightning/pay/check", &PaymentHashBody { payment_hash }).await
	}

	async fn spent_vtxos(&self, vtxo_ids: Vec<VtxoId>) -> Result<Vec<VtxoId>, ServerError> {
		let body: VtxoIdsBody = self.post("/v1/vtxos/spent", &VtxoIdsBody { vtxo_ids }).await?;
		Ok(body.vtxo_ids)
	}
}
