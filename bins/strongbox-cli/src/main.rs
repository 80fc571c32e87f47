//! strongbox-cli — Operator interface for the strongbox custodial wallet.
//!
//! Manages keystore records, sends payments, builds time-locked
//! transactions and queries chain state through an Esplora endpoint.
//! Passwords are always read from the terminal, never from arguments.

mod config;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use bitcoin::{Amount, Denomination, SignedAmount};
use clap::{Args, Parser, Subcommand};
use strongbox_esplora::EsploraClient;
use strongbox_wallet::{
    Custodian, JsonFileStorage, Keystore, Network, PaymentRequest, TxState, WalletRef,
};
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

use crate::config::Config;

/// strongbox custodial Bitcoin wallet.
#[derive(Parser)]
#[command(name = "strongbox-cli", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the environment configuration.
#[derive(Args)]
struct GlobalArgs {
    /// Network (mainnet or testnet).
    #[arg(long, global = true)]
    network: Option<String>,

    /// Esplora REST base URL.
    #[arg(long, global = true)]
    esplora_url: Option<String>,

    /// Keystore file path.
    #[arg(long, global = true)]
    keystore: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keystore management.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Send a payment and broadcast it.
    Send(SendArgs),
    /// Sign a payment that cannot be mined before a given time.
    Timelock(TimelockArgs),
    /// Show the averaged feerate estimate.
    Fee,
    /// Show the confirmed and pending balance of an address.
    Balance(AddressArgs),
    /// List transactions touching an address.
    History(AddressArgs),
    /// Show confirmation status of transactions.
    Verify(VerifyArgs),
    /// Check whether an address is valid for the configured network.
    ValidateAddress(ValidateAddressArgs),
}

#[derive(Subcommand)]
enum WalletAction {
    /// Create a single-key wallet.
    Create,
    /// Create an HD wallet from a fresh 24-word mnemonic.
    CreateHd,
    /// Import an HD wallet from an existing mnemonic.
    Import(ImportArgs),
    /// Reveal the mnemonic of an HD wallet.
    Mnemonic(MnemonicArgs),
    /// List stored wallets.
    List,
    /// Derive a P2SH m-of-n multisig address.
    Multisig(MultisigArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// Mnemonic phrase (prompted for if omitted).
    #[arg(long)]
    mnemonic: Option<String>,
}

#[derive(Args)]
struct MnemonicArgs {
    /// Wallet id.
    id: String,
}

#[derive(Args)]
struct MultisigArgs {
    /// Required signatures.
    #[arg(short, long)]
    m: usize,

    /// Hex-encoded public keys, in order.
    #[arg(required = true)]
    pubkeys: Vec<String>,
}

#[derive(Args)]
struct PaymentArgs {
    /// Wallet id to spend from.
    #[arg(long, required_unless_present = "from")]
    wallet: Option<String>,

    /// Wallet address to spend from; with --wallet, must be that wallet's address.
    #[arg(long)]
    from: Option<String>,

    /// Recipient address.
    #[arg(short, long)]
    to: String,

    /// Amount in BTC (e.g. 0.0005).
    #[arg(short, long)]
    amount: String,
}

#[derive(Args)]
struct SendArgs {
    #[command(flatten)]
    payment: PaymentArgs,
}

#[derive(Args)]
struct TimelockArgs {
    #[command(flatten)]
    payment: PaymentArgs,

    /// Earliest spend time, UNIX seconds.
    #[arg(long)]
    unlock_time: u64,
}

#[derive(Args)]
struct VerifyArgs {
    /// Transaction ids.
    #[arg(required = true)]
    txids: Vec<String>,
}

#[derive(Args)]
struct AddressArgs {
    address: String,
}

#[derive(Args)]
struct ValidateAddressArgs {
    address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli.global)?;

    match cli.command {
        Commands::Wallet { action } => match action {
            WalletAction::Create => wallet_create(&config, false).await,
            WalletAction::CreateHd => wallet_create(&config, true).await,
            WalletAction::Import(args) => wallet_import(&config, args).await,
            WalletAction::Mnemonic(args) => wallet_mnemonic(&config, args).await,
            WalletAction::List => wallet_list(&config).await,
            WalletAction::Multisig(args) => wallet_multisig(&config, args).await,
        },
        Commands::Send(args) => send(&config, args).await,
        Commands::Timelock(args) => timelock(&config, args).await,
        Commands::Fee => fee(&config).await,
        Commands::Balance(args) => balance(&config, args).await,
        Commands::History(args) => history(&config, args).await,
        Commands::Verify(args) => verify(&config, args).await,
        Commands::ValidateAddress(args) => validate_address(&config, args).await,
    }
}

/// Log to stderr, filtered by `RUST_LOG`; JSON lines when `STRONGBOX_LOG_JSON=1`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var("STRONGBOX_LOG_JSON")
        .map(|value| value == "1")
        .unwrap_or(false);

    if use_json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn load_config(global: &GlobalArgs) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(network) = &global.network {
        let network = Network::from_str(network)
            .context("Invalid network (must be 'mainnet' or 'testnet')")?;
        if global.esplora_url.is_none() && config.esplora_url == config.network.default_esplora_url() {
            config.esplora_url = network.default_esplora_url().to_string();
        }
        config.network = network;
    }
    if let Some(url) = &global.esplora_url {
        config.esplora_url = url.clone();
    }
    if let Some(path) = &global.keystore {
        config.keystore_path = path.clone();
    }
    Ok(config)
}

fn open_custodian(config: &Config) -> Result<Custodian<EsploraClient>> {
    let wallet_config = config.wallet_config();
    let keystore = Keystore::new(
        Box::new(JsonFileStorage::new(&config.keystore_path)),
        config.network,
        wallet_config.kdf,
    );
    let provider = EsploraClient::new(&config.esplora_url, config.http_timeout)
        .context("Failed to build Esplora client")?;
    Custodian::new(keystore, provider, wallet_config).context("Failed to open custodian")
}

/// Create a single-key or HD wallet record.
async fn wallet_create(config: &Config, hd: bool) -> Result<()> {
    let custodian = open_custodian(config)?;
    let password = prompt_new_password()?;

    let created = if hd {
        custodian.create_hd_wallet(&password)
    } else {
        custodian.create_single_wallet(&password)
    }
    .context("Failed to create wallet")?;

    println!("\n=== WALLET CREATED ===");
    println!("Network:  {}", config.network);
    println!("Id:       {}", created.id);
    println!("Address:  {}", created.address);
    if let Some(xpub) = &created.xpub {
        println!("Xpub:     {xpub}");
        println!("\nThe mnemonic can be revealed with `strongbox-cli wallet mnemonic {}`.", created.id);
    }
    println!("\nKeystore: {}", config.keystore_path.display());
    Ok(())
}

/// Import an HD wallet from a mnemonic.
async fn wallet_import(config: &Config, args: ImportArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let phrase = match args.mnemonic {
        Some(m) => Zeroizing::new(m),
        None => prompt_password("Enter mnemonic phrase")?,
    };
    let password = prompt_new_password()?;

    let created = custodian
        .import_hd_wallet(&phrase, &password)
        .context("Failed to import wallet")?;

    println!("\n=== WALLET IMPORTED ===");
    println!("Id:       {}", created.id);
    println!("Address:  {}", created.address);
    if let Some(xpub) = &created.xpub {
        println!("Xpub:     {xpub}");
    }
    Ok(())
}

/// Reveal an HD wallet's mnemonic.
async fn wallet_mnemonic(config: &Config, args: MnemonicArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let password = prompt_password("Wallet password")?;
    let phrase = custodian
        .retrieve_mnemonic(&args.id, &password)
        .context("Failed to retrieve mnemonic")?;

    println!("{}", phrase.as_str());
    println!("\nWARNING: Anyone with this phrase can spend from the wallet.");
    Ok(())
}

/// List stored wallets.
async fn wallet_list(config: &Config) -> Result<()> {
    let custodian = open_custodian(config)?;
    let records = custodian.keystore().records().context("Failed to read keystore")?;

    if records.is_empty() {
        println!("No wallets in {}", config.keystore_path.display());
        return Ok(());
    }

    println!("{:<34} {:<7} ADDRESS", "ID", "KIND");
    for record in &records {
        println!("{:<34} {:<7} {}", record.id, record.kind().to_string(), record.address);
    }
    Ok(())
}

/// Derive a P2SH multisig address.
async fn wallet_multisig(config: &Config, args: MultisigArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let multisig = custodian
        .create_multisig_address(&args.pubkeys, args.m)
        .context("Failed to build multisig address")?;

    println!("Address:       {}", multisig.address);
    println!("Policy:        {}-of-{}", multisig.m, multisig.n);
    println!("Redeem script: {}", multisig.redeem_script);
    Ok(())
}

/// Send a payment and broadcast it.
async fn send(config: &Config, args: SendArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let request = payment_request(args.payment)?;

    let receipt = custodian.send(&request).await.context("Failed to send payment")?;

    println!("\n=== TRANSACTION SENT ===");
    println!("Txid:     {}", receipt.txid);
    println!("Amount:   {} BTC", format_btc(request.amount_sats));
    println!("Fee:      {} sats ({:.2} sat/vB)", receipt.fee_sats, receipt.feerate);
    if receipt.absorbed_sats > 0 {
        println!("Dust:     {} sats added to the fee", receipt.absorbed_sats);
    }
    Ok(())
}

/// Sign a time-locked payment and print its hex.
async fn timelock(config: &Config, args: TimelockArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let request = payment_request(args.payment)?;

    let locked = custodian
        .create_time_locked_transaction(&request, args.unlock_time)
        .await
        .context("Failed to create time-locked transaction")?;

    println!("Txid:      {}", locked.txid);
    println!("Lock time: {}", locked.lock_time);
    println!("Fee:       {} sats ({:.2} sat/vB)", locked.fee_sats, locked.feerate);
    if locked.absorbed_sats > 0 {
        println!("Dust:      {} sats added to the fee", locked.absorbed_sats);
    }
    println!("\n{}", locked.tx_hex);
    Ok(())
}

/// Print the averaged feerate.
async fn fee(config: &Config) -> Result<()> {
    let custodian = open_custodian(config)?;
    let feerate = custodian
        .estimate_feerate()
        .await
        .context("Failed to estimate feerate")?;
    println!("{feerate:.2} sat/vB");
    Ok(())
}

/// Print an address balance.
async fn balance(config: &Config, args: AddressArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let balance = custodian
        .balance(&args.address)
        .await
        .context("Failed to fetch balance")?;
    let output = serde_json::json!({
        "address": balance.address,
        "confirmedBTC": format_btc(balance.confirmed_sats),
        "pendingBTC": format_signed_btc(balance.pending_sats),
        "confirmedSats": balance.confirmed_sats,
        "pendingSats": balance.pending_sats,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Print an address's transactions, newest first.
async fn history(config: &Config, args: AddressArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let txs = custodian
        .transactions(&args.address)
        .await
        .context("Failed to fetch transactions")?;

    if txs.is_empty() {
        println!("No transactions for {}", args.address);
        return Ok(());
    }
    for tx in &txs {
        let state = match tx.status.block_height {
            Some(height) if tx.status.confirmed => format!("block {height}"),
            _ => "unconfirmed".to_string(),
        };
        println!("{}  {:>16} BTC  {state}", tx.txid, format_signed_btc(tx.net()));
    }
    Ok(())
}

/// Print confirmation status for each txid.
async fn verify(config: &Config, args: VerifyArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let results = custodian
        .verify_transactions(&args.txids)
        .await
        .context("Failed to query transactions")?;

    for entry in &results {
        match &entry.state {
            TxState::Confirmed {
                confirmations,
                block_height,
            } => println!(
                "{}  confirmed ({confirmations} confirmations, block {block_height})",
                entry.txid
            ),
            TxState::Unconfirmed => println!("{}  unconfirmed", entry.txid),
            TxState::Unavailable(reason) => println!("{}  unavailable: {reason}", entry.txid),
        }
    }
    Ok(())
}

/// Print whether an address is valid.
async fn validate_address(config: &Config, args: ValidateAddressArgs) -> Result<()> {
    let custodian = open_custodian(config)?;
    let check = custodian.validate_address(&args.address);
    let output = serde_json::json!({
        "address": check.address,
        "isValid": check.is_valid,
        "network": check.network.map(|n| n.to_string()),
        "matchesConfiguredNetwork": check.matches_configured_network,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn payment_request(args: PaymentArgs) -> Result<PaymentRequest> {
    let amount_sats = parse_btc(&args.amount)?;
    let wallet = match (args.wallet, &args.from) {
        (Some(id), _) => WalletRef::Id(id),
        (None, Some(address)) => WalletRef::Address(address.clone()),
        (None, None) => bail!("Either --wallet or --from is required"),
    };
    let password = prompt_password("Wallet password")?;
    Ok(PaymentRequest {
        wallet,
        password,
        to: args.to,
        amount_sats,
        from_address: args.from,
    })
}

/// Parse a BTC decimal string into sats.
fn parse_btc(s: &str) -> Result<u64> {
    let amount = Amount::from_str_in(s.trim(), Denomination::Bitcoin)
        .with_context(|| format!("Invalid BTC amount: {s}"))?;
    if amount == Amount::ZERO {
        bail!("Amount must be positive");
    }
    Ok(amount.to_sat())
}

fn format_btc(sats: u64) -> String {
    Amount::from_sat(sats).to_string_in(Denomination::Bitcoin)
}

fn format_signed_btc(sats: i64) -> String {
    SignedAmount::from_sat(sats).to_string_in(Denomination::Bitcoin)
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(format!("{prompt}: "))
        .map(Zeroizing::new)
        .context("Failed to read password")
}

fn prompt_new_password() -> Result<Zeroizing<String>> {
    let password = prompt_password("Enter wallet password")?;
    let confirm = prompt_password("Confirm password")?;
    if *password != *confirm {
        bail!("Passwords do not match");
    }
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_btc_amounts() {
        assert_eq!(parse_btc("0.0005").unwrap(), 50_000);
        assert_eq!(parse_btc("1").unwrap(), 100_000_000);
        assert_eq!(parse_btc(" 0.00000546 ").unwrap(), 546);
    }

    #[test]
    fn parse_btc_rejects_bad_input() {
        assert!(parse_btc("0").is_err());
        assert!(parse_btc("abc").is_err());
        assert!(parse_btc("-1").is_err());
        assert!(parse_btc("0.000000001").is_err());
    }

    #[test]
    fn format_btc_output() {
        assert_eq!(format_btc(50_000), "0.0005");
        assert_eq!(format_signed_btc(-51_130), "-0.0005113");
    }

    #[test]
    fn cli_parses_send() {
        let cli = Cli::try_parse_from([
            "strongbox-cli",
            "send",
            "--wallet",
            "abcd",
            "--to",
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
            "--amount",
            "0.0005",
        ])
        .unwrap();
        match cli.command {
            Commands::Send(args) => {
                assert_eq!(args.payment.wallet.as_deref(), Some("abcd"));
                assert_eq!(args.payment.amount, "0.0005");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn cli_accepts_wallet_with_from_hint() {
        let cli = Cli::try_parse_from([
            "strongbox-cli",
            "send",
            "--wallet",
            "abcd",
            "--from",
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
            "--to",
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
            "--amount",
            "0.0005",
        ])
        .unwrap();
        let Commands::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.payment.wallet.as_deref(), Some("abcd"));
        assert_eq!(
            args.payment.from.as_deref(),
            Some("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
        );
    }

    #[test]
    fn cli_parses_balance_and_history() {
        let cli = Cli::try_parse_from(["strongbox-cli", "balance", "tb1qexample"]).unwrap();
        assert!(matches!(cli.command, Commands::Balance(ref a) if a.address == "tb1qexample"));
        let cli = Cli::try_parse_from(["strongbox-cli", "history", "tb1qexample"]).unwrap();
        assert!(matches!(cli.command, Commands::History(ref a) if a.address == "tb1qexample"));
        assert!(Cli::try_parse_from(["strongbox-cli", "balance"]).is_err());
    }

    #[test]
    fn cli_requires_a_wallet_selector() {
        assert!(Cli::try_parse_from(["strongbox-cli", "send", "--to", "x", "--amount", "1"]).is_err());
    }

    #[test]
    fn cli_global_overrides() {
        let cli = Cli::try_parse_from(["strongbox-cli", "fee", "--network", "mainnet", "--keystore", "/tmp/k.json"])
            .unwrap();
        assert_eq!(cli.global.network.as_deref(), Some("mainnet"));
        assert_eq!(cli.global.keystore, Some(PathBuf::from("/tmp/k.json")));
    }
}
