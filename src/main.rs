use std::process::ExitCode;
use std::{env, fs};

use apis::kolors::{Kolors, KolorsConfig, KolorsError, PollOutcome};

mod apis;
mod utilities;

const USAGE: &str = "usage: kolors-client <reference-image> <prompt>";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    utilities::logger::init();
    dotenvy::dotenv().ok();

    let mut args = env::args().skip(1);
    let Some(image_path) = args.next() else {
        log::error!("{USAGE}");
        return ExitCode::FAILURE;
    };

    let prompt = args.collect::<Vec<_>>().join(" ");

    if prompt.is_empty() {
        log::error!("{USAGE}");
        return ExitCode::FAILURE;
    }

    let image = match fs::read(&image_path) {
        Ok(image) => image,
        Err(err) => {
            log::error!("cannot read {image_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let kolors = Kolors::new(http_client(), KolorsConfig::from_env());

    match generate(&kolors, image, &prompt).await {
        Ok(url) => {
            log::info!("job completed: {url}");
            println!("{url}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn http_client() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(user_agent) = env::var("USER_AGENT") {
        builder = builder.user_agent(user_agent);
    }

    builder.build().unwrap()
}

async fn generate(kolors: &Kolors, image: Vec<u8>, prompt: &str) -> Result<String, KolorsError> {
    let asset_path = kolors.upload_image(image).await?;
    log::info!("reference image stored as {asset_path}");

    let session_hash = kolors.submit_job(prompt, &asset_path).await?;
    log::info!("job {session_hash} queued");

    loop {
        match kolors.poll_job(&session_hash).await? {
            PollOutcome::Completed(url) => return Ok(url),
            PollOutcome::Pending(_) => log::info!("job {session_hash} still pending"),
        }
    }
}
