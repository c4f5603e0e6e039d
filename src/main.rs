use policy_manager::{config::Config, run};

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|err| panic!("failed to load config: {err}"));

    run(config)
        .await
        .unwrap_or_else(|err| panic!("server error: {err}"));
}
