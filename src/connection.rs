//! JSON-RPC connection to a bitcoind node.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Block, BlockHash};
use jsonrpc::{arg, client::Client, simple_http::SimpleHttpTransport};
use serde_json::Value as Json;

use crate::config::BitcoindConfig;
use crate::error::{BitcoindError, ResponseErrorKind, SyncError};

// bitcoind's "Block height out of range" error code.
const RPC_INVALID_PARAMETER: i32 = -8;

macro_rules! params {
    ($($param:expr),* $(,)?) => {
        [
            $(
                arg($param),
            )*
        ]
    };
}

/// What `getblockchaininfo` says about the node's view of the chain.
#[derive(Clone, Debug)]
pub struct ChainInfo {
    pub blocks: u32,
    pub headers: u32,
    pub best_block_hash: BlockHash,
    pub initial_block_download: bool,
}

#[derive(Clone, Debug)]
pub struct HeaderInfo {
    pub height: u32,
    /// -1 if the block is not in the best chain
    pub confirmations: i64,
    pub previous: Option<BlockHash>,
}

/// The bitcoind RPCs the chain client relies on.
pub(crate) trait BitcoindRpc: Send + Sync {
    fn chain_info(&self) -> Result<ChainInfo, BitcoindError>;

    /// [`BitcoindError::HeightOutOfRange`] past the tip.
    fn block_hash(&self, height: u32) -> Result<BlockHash, BitcoindError>;

    fn block(&self, hash: &BlockHash) -> Result<Block, BitcoindError>;

    fn header_info(&self, hash: &BlockHash) -> Result<HeaderInfo, BitcoindError>;
}

pub struct Connection {
    client: Client,
    retries: usize,
}

impl Connection {
    /// Connect to bitcoind and check it answers.
    pub async fn connect(config: &BitcoindConfig) -> Result<Arc<Self>, SyncError> {
        log::info!("Connecting to bitcoind at {}", config.addr);
        let config = config.clone();
        let conn = tokio::task::spawn_blocking(move || Self::connect_blocking(&config))
            .await
            .map_err(|e| SyncError::Network(format!("Connection task failed: {}", e)))??;
        log::info!("Connection to bitcoind established");
        Ok(Arc::new(conn))
    }

    fn connect_blocking(config: &BitcoindConfig) -> Result<Self, BitcoindError> {
        let cookie = fs::read_to_string(&config.cookie_path).map_err(|e| {
            log::error!(
                "Failed to read cookie file at {}: {}",
                config.cookie_path.display(),
                e
            );
            BitcoindError::CookieFile(e)
        })?;
        let url = format!("http://{}", config.addr);

        // Short timeout for the first request so a wrong address fails fast.
        let ping = Client::with_transport(
            SimpleHttpTransport::builder()
                .url(&url)?
                .timeout(Duration::from_secs(3))
                .cookie_auth(cookie.clone())
                .build(),
        );
        ping.send_request(ping.build_request("echo", &[]))?;
        log::debug!("bitcoind answered the echo request");

        let client = Client::with_transport(
            SimpleHttpTransport::builder()
                .url(&url)?
                .timeout(config.rpc_timeout)
                .cookie_auth(cookie)
                .build(),
        );
        Ok(Self {
            client,
            retries: config.retries,
        })
    }

    /// Retry a request upon transport failure or while bitcoind is warming up.
    fn retry<T, R: Fn() -> Result<T, BitcoindError>>(&self, request: R) -> Result<T, BitcoindError> {
        let mut attempt = 0;
        loop {
            match request() {
                Ok(res) => return Ok(res),
                Err(e) if (e.is_warming_up() || e.is_transport()) && attempt < self.retries => {
                    attempt += 1;
                    log::debug!("Retrying RPC request to bitcoind: attempt #{}", attempt);
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn request(
        &self,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<Json, BitcoindError> {
        self.retry(|| {
            let req = self.client.build_request(method, params);
            log::trace!("Sending to bitcoind: {:#?}", req);
            let res = self.client.send_request(req)?.result::<Json>()?;
            log::trace!("Got from bitcoind: {:#?}", res);
            Ok(res)
        })
    }
}

impl BitcoindRpc for Connection {
    fn chain_info(&self) -> Result<ChainInfo, BitcoindError> {
        let res = self.request("getblockchaininfo", &[])?;
        Ok(ChainInfo {
            blocks: get_u32(&res, "blocks")?,
            headers: get_u32(&res, "headers")?,
            best_block_hash: parse_hash(get_str(&res, "bestblockhash")?)?,
            initial_block_download: res
                .get("initialblockdownload")
                .and_then(Json::as_bool)
                .unwrap_or(false),
        })
    }

    fn block_hash(&self, height: u32) -> Result<BlockHash, BitcoindError> {
        match self.request("getblockhash", &params!(Json::from(height))) {
            Ok(res) => parse_hash(
                res.as_str()
                    .ok_or_else(|| BitcoindError::response_error(ResponseErrorKind::InvalidHash))?,
            ),
            Err(BitcoindError::Server(jsonrpc::error::Error::Rpc(ref e)))
                if e.code == RPC_INVALID_PARAMETER =>
            {
                Err(BitcoindError::HeightOutOfRange(height))
            }
            Err(e) => Err(e),
        }
    }

    fn block(&self, hash: &BlockHash) -> Result<Block, BitcoindError> {
        let res = self.request(
            "getblock",
            &params!(Json::String(hash.to_string()), Json::from(0)),
        )?;
        let raw = res
            .as_str()
            .ok_or_else(|| BitcoindError::response_error(ResponseErrorKind::InvalidBlockData))?;
        let bytes = hex::decode(raw).map_err(|e| {
            BitcoindError::response_error(ResponseErrorKind::InvalidBlockData).with_source(e)
        })?;
        bitcoin::consensus::deserialize(&bytes).map_err(|e| {
            BitcoindError::response_error(ResponseErrorKind::InvalidBlockData).with_source(e)
        })
    }

    fn header_info(&self, hash: &BlockHash) -> Result<HeaderInfo, BitcoindError> {
        let res = self.request(
            "getblockheader",
            &params!(Json::String(hash.to_string()), Json::Bool(true)),
        )?;
        let previous = match res.get("previousblockhash").and_then(Json::as_str) {
            Some(h) => Some(parse_hash(h)?),
            None => None,
        };
        Ok(HeaderInfo {
            height: get_u32(&res, "height")?,
            confirmations: res
                .get("confirmations")
                .and_then(Json::as_i64)
                .ok_or_else(|| {
                    BitcoindError::response_error(ResponseErrorKind::MissingField("confirmations"))
                })?,
            previous,
        })
    }
}

fn get_u32(res: &Json, field: &'static str) -> Result<u32, BitcoindError> {
    res.get(field)
        .and_then(Json::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| BitcoindError::response_error(ResponseErrorKind::MissingField(field)))
}

fn get_str<'a>(res: &'a Json, field: &'static str) -> Result<&'a str, BitcoindError> {
    res.get(field)
        .and_then(Json::as_str)
        .ok_or_else(|| BitcoindError::response_error(ResponseErrorKind::MissingField(field)))
}

fn parse_hash(s: &str) -> Result<BlockHash, BitcoindError> {
    s.parse::<BlockHash>().map_err(|e| {
        BitcoindError::response_error(ResponseErrorKind::InvalidHash).with_source(e)
    })
}

/// Run a blocking RPC on the blocking pool.
pub(crate) async fn blocking<T, F>(rpc: &Arc<dyn BitcoindRpc>, call: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce(&dyn BitcoindRpc) -> Result<T, BitcoindError> + Send + 'static,
{
    let rpc = rpc.clone();
    tokio::task::spawn_blocking(move || call(rpc.as_ref()))
        .await
        .map_err(|e| SyncError::Network(format!("RPC task failed: {}", e)))?
        .map_err(SyncError::from)
}
