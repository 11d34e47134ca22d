//! Shared test backends: an in-memory frame network, an instantly settling
//! chain stub and deterministic wallets.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use paynode::chain::{
    AdjudicatorEvent, AdjudicatorReq, ChainBackend, ChainError, ChainProvider, FundingReq,
};
use paynode::channel::state::State;
use paynode::channel::PartIdx;
use paynode::codec::types::{Address, Hash, Signature};
use paynode::config::{SessionConfig, UserConfig, WalletConfig};
use paynode::idprovider::Peer;
use paynode::session::Backends;
use paynode::sig::Signer;
use paynode::wallet::{Account, Wallet, WalletBackend, WalletError};
use paynode::wire::{Bus, CommBackend, Frame, Identity, Inbound, Registerer, WireError};

pub const ADJUDICATOR: Address = Address([0xAA; 20]);
pub const ASSET_ETH: Address = Address([0xAB; 20]);

// ---- wallets -------------------------------------------------------------

struct SignerAccount(Signer);

impl Account for SignerAccount {
    fn address(&self) -> Address {
        self.0.address()
    }

    fn sign(&self, msg: Hash) -> Signature {
        self.0.sign(msg)
    }
}

pub struct StubWallet {
    accounts: HashMap<Address, Arc<SignerAccount>>,
}

impl Wallet for StubWallet {
    fn unlock(&self, addr: &Address) -> Result<Arc<dyn Account>, WalletError> {
        self.accounts
            .get(addr)
            .cloned()
            .map(|a| a as Arc<dyn Account>)
            .ok_or_else(|| WalletError::UnknownAccount(addr.hex()))
    }

    fn lock_all(&self) {}
}

#[derive(Default)]
pub struct StubWalletBackend {
    wallets: Mutex<HashMap<String, Arc<StubWallet>>>,
}

impl StubWalletBackend {
    /// Registers a wallet under a keystore path; returns the account
    /// addresses in seed order.
    pub fn add_wallet(&self, keystore_path: &str, seeds: &[u64]) -> Vec<Address> {
        let mut accounts = HashMap::new();
        let mut addrs = Vec::new();
        for &seed in seeds {
            let signer = Signer::from_seed(seed);
            addrs.push(signer.address());
            accounts.insert(signer.address(), Arc::new(SignerAccount(signer)));
        }
        self.wallets
            .lock()
            .insert(keystore_path.to_string(), Arc::new(StubWallet { accounts }));
        addrs
    }
}

impl WalletBackend for StubWalletBackend {
    fn parse_addr(&self, s: &str) -> Result<Address, WalletError> {
        Address::from_hex(s).ok_or_else(|| WalletError::InvalidAddress(s.to_string()))
    }

    fn open_wallet(
        &self,
        keystore_path: &str,
        _password: &str,
    ) -> Result<Arc<dyn Wallet>, WalletError> {
        self.wallets
            .lock()
            .get(keystore_path)
            .cloned()
            .map(|w| w as Arc<dyn Wallet>)
            .ok_or_else(|| WalletError::Keystore(format!("unknown keystore {keystore_path}")))
    }
}

// ---- chain ---------------------------------------------------------------

/// One shared "blockchain" per test. Funding completes when every
/// participant has deposited; registration fans events out to watchers.
pub struct StubChain {
    adjudicator: Address,
    asset_eth: Address,
    erc20s: Mutex<HashMap<Address, (Address, String, u8)>>,
    funded: Mutex<HashMap<Hash, HashSet<PartIdx>>>,
    registered: Mutex<HashMap<Hash, u64>>,
    registered_states: Mutex<HashMap<Hash, State>>,
    withdrawn: Mutex<HashSet<(Hash, PartIdx)>>,
    watchers: Mutex<HashMap<Hash, Vec<mpsc::Sender<AdjudicatorEvent>>>>,
    funding_progress: Notify,
}

impl StubChain {
    pub fn new() -> Arc<Self> {
        Arc::new(StubChain {
            adjudicator: ADJUDICATOR,
            asset_eth: ASSET_ETH,
            erc20s: Mutex::new(HashMap::new()),
            funded: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            registered_states: Mutex::new(HashMap::new()),
            withdrawn: Mutex::new(HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
            funding_progress: Notify::new(),
        })
    }

    /// Deploys a fake ERC-20 asset holder for `symbol`.
    pub fn add_erc20(&self, token: Address, asset: Address, symbol: &str, decimals: u8) {
        self.erc20s
            .lock()
            .insert(asset, (token, symbol.to_string(), decimals));
    }

    pub fn registered_version(&self, ch_id: &Hash) -> Option<u64> {
        self.registered.lock().get(ch_id).copied()
    }

    /// Progresses the registered state of a channel on-chain: bumps the
    /// version and fans the progression out to every watcher. Returns the
    /// progressed version.
    pub async fn progress(&self, ch_id: &Hash) -> u64 {
        let state = self
            .registered_states
            .lock()
            .get(ch_id)
            .cloned()
            .expect("no registered state to progress");
        let next = state.make_next_state();
        let version = next.version();

        self.registered.lock().insert(*ch_id, version);
        self.registered_states.lock().insert(*ch_id, next.clone());

        let watchers = self.watchers.lock().get(ch_id).cloned().unwrap_or_default();
        for watcher in watchers {
            let _ = watcher
                .send(AdjudicatorEvent::Progressed {
                    channel_id: *ch_id,
                    state: next.clone(),
                })
                .await;
        }
        version
    }

    pub fn withdrawals(&self, ch_id: &Hash) -> usize {
        self.withdrawn
            .lock()
            .iter()
            .filter(|(id, _)| id == ch_id)
            .count()
    }
}

#[async_trait]
impl ChainBackend for StubChain {
    async fn validate_adjudicator(&self, adjudicator: Address) -> Result<(), ChainError> {
        if adjudicator != self.adjudicator {
            return Err(ChainError::InvalidContract {
                kind: "adjudicator",
                addr: adjudicator.hex(),
            });
        }
        Ok(())
    }

    async fn validate_asset_eth(
        &self,
        adjudicator: Address,
        asset_eth: Address,
    ) -> Result<(), ChainError> {
        self.validate_adjudicator(adjudicator).await?;
        if asset_eth != self.asset_eth {
            return Err(ChainError::InvalidContract {
                kind: "asset",
                addr: asset_eth.hex(),
            });
        }
        Ok(())
    }

    async fn validate_asset_erc20(
        &self,
        adjudicator: Address,
        token: Address,
        asset: Address,
    ) -> Result<(String, u8), ChainError> {
        self.validate_adjudicator(adjudicator).await?;
        let erc20s = self.erc20s.lock();
        match erc20s.get(&asset) {
            Some((expected_token, symbol, decimals)) if *expected_token == token => {
                Ok((symbol.clone(), *decimals))
            }
            Some(_) => Err(ChainError::Call("token reference mismatch".into())),
            None => Err(ChainError::InvalidContract {
                kind: "asset",
                addr: asset.hex(),
            }),
        }
    }

    async fn fund(&self, req: FundingReq) -> Result<(), ChainError> {
        let ch_id = req.state.channel_id();
        let total = req.params.participants.len();
        self.funded.lock().entry(ch_id).or_default().insert(req.idx);
        self.funding_progress.notify_waiters();

        loop {
            let waiter = self.funding_progress.notified();
            if self
                .funded
                .lock()
                .get(&ch_id)
                .map(|set| set.len() == total)
                .unwrap_or(false)
            {
                return Ok(());
            }
            waiter.await;
        }
    }

    async fn register(&self, req: AdjudicatorReq) -> Result<(), ChainError> {
        let ch_id = req.tx.state.channel_id();
        let version = req.tx.state.version();
        self.registered.lock().insert(ch_id, version);
        self.registered_states.lock().insert(ch_id, req.tx.state.clone());

        let watchers = self.watchers.lock().get(&ch_id).cloned().unwrap_or_default();
        for watcher in watchers {
            let _ = watcher
                .send(AdjudicatorEvent::Registered {
                    channel_id: ch_id,
                    version,
                })
                .await;
        }
        Ok(())
    }

    async fn withdraw(&self, req: AdjudicatorReq) -> Result<(), ChainError> {
        let ch_id = req.tx.state.channel_id();
        self.withdrawn.lock().insert((ch_id, req.idx));
        Ok(())
    }

    fn subscribe(&self, channel_id: Hash) -> mpsc::Receiver<AdjudicatorEvent> {
        let (tx, rx) = mpsc::channel(8);
        self.watchers.lock().entry(channel_id).or_default().push(tx);
        rx
    }
}

pub struct StubChainProvider {
    pub chain: Arc<StubChain>,
}

#[async_trait]
impl ChainProvider for StubChainProvider {
    async fn connect(
        &self,
        _url: &str,
        _conn_timeout: Duration,
        _on_chain_tx_timeout: Duration,
        _on_chain: paynode::wallet::Credential,
    ) -> Result<Arc<dyn ChainBackend>, ChainError> {
        Ok(Arc::clone(&self.chain) as Arc<dyn ChainBackend>)
    }
}

// ---- in-memory network ---------------------------------------------------

/// Routes frames between endpoints by off-chain address. Frames take the
/// full encode/decode round trip so the wire layout is exercised end to
/// end.
#[derive(Default)]
pub struct TestNet {
    endpoints: Mutex<HashMap<Address, mpsc::Sender<Inbound>>>,
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(TestNet::default())
    }

    /// Simulates an unclean process death: the endpoint vanishes without a
    /// shutdown frame and its inbound stream ends.
    pub fn kill(&self, addr: &Address) {
        self.endpoints.lock().remove(addr);
    }
}

pub struct TestBus {
    own: Address,
    net: Arc<TestNet>,
    closed: AtomicBool,
    comm_addrs: Mutex<HashMap<Address, String>>,
}

impl Registerer for TestBus {
    fn register(&self, off_chain_addr: Address, comm_addr: &str) {
        self.comm_addrs
            .lock()
            .insert(off_chain_addr, comm_addr.to_string());
    }
}

#[async_trait]
impl Bus for TestBus {
    async fn send(&self, recipient: &Identity, frame: Frame) -> Result<(), WireError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WireError::Closed);
        }
        // Round-trip through the frame layout, as a real transport would.
        let bytes = frame.to_bytes()?;
        let frame = Frame::from_bytes(&bytes)?;

        let target = self
            .net
            .endpoints
            .lock()
            .get(recipient)
            .cloned()
            .ok_or(WireError::UnknownRecipient(*recipient))?;
        target
            .send(Inbound {
                from: self.own,
                frame,
            })
            .await
            .map_err(|_| WireError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.net.kill(&self.own);
    }
}

pub struct TestComm {
    pub net: Arc<TestNet>,
}

impl CommBackend for TestComm {
    fn new_bus(
        &self,
        own: Identity,
        _listen_addr: &str,
    ) -> Result<(Arc<dyn Bus>, mpsc::Receiver<Inbound>), WireError> {
        let (tx, rx) = mpsc::channel(64);
        self.net.endpoints.lock().insert(own, tx);
        let bus = Arc::new(TestBus {
            own,
            net: Arc::clone(&self.net),
            closed: AtomicBool::new(false),
            comm_addrs: Mutex::new(HashMap::new()),
        });
        Ok((bus as Arc<dyn Bus>, rx))
    }
}

// ---- environment ---------------------------------------------------------

pub struct TestEnv {
    pub backends: Backends,
    pub wallets: Arc<StubWalletBackend>,
    pub chain: Arc<StubChain>,
    pub net: Arc<TestNet>,
    pub dir: tempfile::TempDir,
}

pub struct TestUser {
    pub name: String,
    pub on_chain_addr: Address,
    pub off_chain_addr: Address,
    pub cfg: SessionConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        // RUST_LOG=paynode=debug makes a failing scenario readable.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let wallets = Arc::new(StubWalletBackend::default());
        let chain = StubChain::new();
        let net = TestNet::new();
        let backends = Backends {
            wallet: Arc::clone(&wallets) as Arc<dyn WalletBackend>,
            chain: Arc::new(StubChainProvider {
                chain: Arc::clone(&chain),
            }),
            comm: Arc::new(TestComm {
                net: Arc::clone(&net),
            }),
        };
        TestEnv {
            backends,
            wallets,
            chain,
            net,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Creates a user with deterministic keys and a private session
    /// directory; `seed` keeps users distinct.
    pub fn user(&self, name: &str, seed: u64, response_timeout_secs: u64) -> TestUser {
        let keystore = format!("keystore-{name}");
        let addrs = self.wallets.add_wallet(&keystore, &[seed, seed + 1000]);
        let (on_chain_addr, off_chain_addr) = (addrs[0], addrs[1]);

        let base = self.dir.path().join(name);
        std::fs::create_dir_all(&base).expect("session dir");

        let wallet_cfg = WalletConfig {
            keystore_path: keystore.clone(),
            password_file: format!("password-{name}"),
        };
        let cfg = SessionConfig {
            user: UserConfig {
                on_chain_addr: on_chain_addr.hex(),
                on_chain_wallet: wallet_cfg.clone(),
                off_chain_addr: off_chain_addr.hex(),
                off_chain_wallet: wallet_cfg,
                comm_addr: format!("127.0.0.1:58{seed:02}"),
                comm_type: "tcp".into(),
            },
            chain_url: "ws://127.0.0.1:8545".into(),
            chain_conn_timeout_secs: 10,
            on_chain_tx_timeout_secs: 10,
            response_timeout_secs,
            peer_reconn_timeout_secs: 10,
            adjudicator: ADJUDICATOR.hex(),
            asset: ASSET_ETH.hex(),
            database_dir: base.join("db").to_string_lossy().into_owned(),
            id_provider_type: "yaml".into(),
            id_provider_url: base.join("peers.yaml").to_string_lossy().into_owned(),
        };

        TestUser {
            name: name.to_string(),
            on_chain_addr,
            off_chain_addr,
            cfg,
        }
    }
}

impl TestUser {
    /// The peer entry other users register for this one.
    pub fn as_peer(&self, alias: &str) -> Peer {
        Peer {
            alias: alias.to_string(),
            off_chain_addr: self.off_chain_addr,
            comm_type: "tcp".into(),
            comm_addr: self.cfg.user.comm_addr.clone(),
        }
    }

    /// Writes the session config to disk for `Node::open_session`.
    pub fn write_config(&self, dir: &std::path::Path) -> String {
        let path = dir.join(format!("{}-session.yaml", self.name));
        self.cfg.save(&path).expect("write session config");
        path.to_string_lossy().into_owned()
    }
}

