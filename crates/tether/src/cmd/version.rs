use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("tether {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: tether");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target: {}", option_env!("TETHER_BUILD_TARGET").unwrap_or("unknown"));
    println!("profile: {}", option_env!("TETHER_BUILD_PROFILE").unwrap_or("unknown"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: peer={}, schema={}, cli=true",
        cfg!(feature = "peer"),
        cfg!(feature = "schema"),
    );

    Ok(SUCCESS)
}
