use clap::Parser;
use iam_authenticator::{
    sources::{IamClientConfig, IamTokenClient},
    ApiKey, ApiKeyAuthenticator, Authenticator, JwtLifetimeInspector,
};
use reqwest::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// The API key traded for access tokens
    #[arg(short = 'k', long, env = "IBMCLOUD_API_KEY", hide_env_values = true)]
    api_key: ApiKey,

    /// The IAM endpoint to request tokens from
    #[arg(short, long, env = "IAM_URL")]
    iam_url: Option<Url>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let exchange = IamTokenClient::new(client, IamClientConfig::default());

    let authenticator =
        ApiKeyAuthenticator::with_parts(opts.api_key, exchange, JwtLifetimeInspector::new());

    if let Some(url) = opts.iam_url {
        authenticator.set_url(url);
    }

    let token = authenticator.token(false).await?;
    tracing::info!(
        token = format_args!("{:#?}", token.access_token()),
        lifetime = token.lifetime().0,
        "first access token"
    );

    let cached = authenticator.token(false).await?;
    tracing::info!(
        reused = cached.access_token() == token.access_token(),
        lifetime = cached.lifetime().0,
        "second access token"
    );

    let fresh = authenticator.token(true).await?;
    tracing::info!(
        token = format_args!("{:#?}", fresh.access_token()),
        lifetime = fresh.lifetime().0,
        "forced access token"
    );

    Ok(())
}
