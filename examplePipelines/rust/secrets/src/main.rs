use sealpipe_sdk::{with_connection, Config, LogOutput, PipelineError};

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let config = Config::default().log_output(LogOutput::Stderr);

    let out = with_connection(config, |client| async move {
        // set secret
        let secret = client.set_secret("ghApiToken", "TOKEN").await?;

        // use secret in container environment
        client
            .container()
            .with_platform("linux/amd64")?
            .from_image("alpine:3.17")?
            .with_secret_variable("GITHUB_API_TOKEN", &secret)?
            .with_exec(["apk", "add", "curl"])?
            .with_exec([
                "sh",
                "-c",
                concat!(
                    r#"curl "https://api.github.com/repos/rust-lang/rust/issues" "#,
                    r#"--header "Accept: application/vnd.github+json" "#,
                    r#"--header "Authorization: Bearer $GITHUB_API_TOKEN""#
                ),
            ])?
            .stdout()
            .await
    })
    .await?;

    // print result
    println!("{out}");

    Ok(())
}
