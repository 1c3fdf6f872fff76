//
// main.rs
//
// Command-line entry point: inspect a build file offline
//

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};

use msbuild_ls::document::{DocumentServices, ProjectDocument};
use msbuild_ls::package_sources::NuGetConfigSources;
use msbuild_ls::semantic::StaticEvaluator;
use msbuild_ls::Config;

fn print_usage() {
    println!(
        "msbuild-ls {}, a positional model of MSBuild files.",
        env!("CARGO_PKG_VERSION")
    );
    print!(
        r#"
Usage: msbuild-ls [OPTIONS]

Available options:

--inspect <file>             Load <file> and print its diagnostics
--offset <n>                 With --inspect, describe the character at offset <n>
--version                    Print the version
--help                       Print this help message

"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut file: Option<PathBuf> = None;
    let mut offset: Option<usize> = None;

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--inspect" => {
                let value = argv.next().ok_or_else(|| anyhow!("--inspect requires a file"))?;
                file = Some(PathBuf::from(value));
            }
            "--offset" => {
                let value = argv.next().ok_or_else(|| anyhow!("--offset requires a number"))?;
                offset = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid offset: '{value}'"))?,
                );
            }
            "--version" => {
                println!("msbuild-ls {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                return Err(anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    let Some(file) = file else {
        if offset.is_some() {
            return Err(anyhow!("--offset requires --inspect"));
        }
        print_usage();
        return Ok(());
    };

    env_logger::init();

    inspect(file, offset).await
}

async fn inspect(file: PathBuf, offset: Option<usize>) -> anyhow::Result<()> {
    let file = if file.is_absolute() {
        file
    } else {
        env::current_dir()
            .context("Cannot read the current directory")?
            .join(file)
    };
    let config = Config::default();
    let services = DocumentServices {
        evaluator: Arc::new(StaticEvaluator::new()),
        package_sources: Arc::new(NuGetConfigSources::new(config.package_feeds.clone())),
        config: Arc::new(config),
        workspace_root: file.parent().map(PathBuf::from),
    };
    let document = ProjectDocument::new(file.clone(), services);
    document.load().await?;

    let reader = document.read().await;
    println!("{} ({:?}, {:?})", file.display(), document.kind(), reader.status());
    for source in reader.package_sources() {
        println!("source {} {}", source.name, source.url);
    }
    for diagnostic in reader.diagnostics() {
        println!("{diagnostic}");
    }

    let Some(offset) = offset else {
        return Ok(());
    };
    let position = reader.position_of(offset)?;
    println!("offset {} is {}", offset, position.position().to_one_based());
    match reader.locate(&position)? {
        Some(location) => {
            let tree = reader.tree()?;
            println!(
                "syntax: {:?} element={} attribute={}",
                location.flags,
                location.element_name(tree).unwrap_or("-"),
                location.attribute_name(tree).unwrap_or("-"),
            );
        }
        None => println!("syntax: none"),
    }
    match reader.find(&position) {
        Ok(Some(object)) => println!(
            "object: {} {} = {}",
            object.kind,
            object.name,
            object.value.as_deref().unwrap_or("")
        ),
        Ok(None) => println!("object: none"),
        Err(err) => println!("object: unavailable ({err})"),
    }
    Ok(())
}
