use clap::Parser;
use coordination::error::CoordinationError;
use wave_gate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.global.json;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match wave_gate::run(cli).await {
        Ok(output) => {
            if json {
                match serde_json::to_string_pretty(&output.json) {
                    Ok(text) => println!("{}", text),
                    Err(e) => eprintln!("error: cannot render output: {}", e),
                }
            } else if !output.human.is_empty() {
                println!("{}", output.human.trim_end());
            }
            output.code
        }
        Err(err) => {
            let coordination = err.downcast_ref::<CoordinationError>();
            if json {
                let body = match coordination {
                    Some(e) => serde_json::to_value(e.to_structured()).unwrap_or_default(),
                    None => serde_json::json!({"code": "ERROR", "message": format!("{:#}", err)}),
                };
                println!("{}", serde_json::json!({ "error": body }));
            } else {
                eprintln!("error: {:#}", err);
                if let Some(e) = coordination {
                    eprintln!("  {}", e.to_structured().recovery_action);
                }
            }
            coordination.map(CoordinationError::exit_code).unwrap_or(1)
        }
    };
    std::process::exit(code);
}
