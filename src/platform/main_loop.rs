use std::path::Path;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::LevelFilter;

use pbf_fluids::{
    error::ConfigError, floating_type_mod::FT, init_fluid_sim, simulation_parameters::SimulationParams,
    write_statistics, FluidSimulation, SceneConfig, V3,
};

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

const DEFAULT_STEPS: &str = "500";
const PROGRESS_INTERVAL: usize = 100;

pub fn start() {
    let matches = App::new("PBF Fluid Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation paramaters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("STEPS")
                        .long("steps")
                        .short("n")
                        .takes_value(true)
                        .default_value(DEFAULT_STEPS)
                        .help("Number of time steps to simulate"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite single keys of the simulation config"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .subcommand(SubCommand::with_name("print-default-config").about("Print the default simulation parameters as YAML"))
        .subcommand(SubCommand::with_name("print-default-scene").about("Print the default scene as YAML"))
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut logger = env_logger::Builder::new();
    logger.filter_level(level);
    logger.parse_default_env();
    logger.init();

    let result = if let Some(run_matches) = matches.subcommand_matches("run") {
        run(run_matches)
    } else if matches.subcommand_matches("print-default-config").is_some() {
        SimulationParams::default().to_yaml_string().map(|s| print!("{}", s))
    } else if matches.subcommand_matches("print-default-scene").is_some() {
        serde_yaml::to_string(&SceneConfig::default_box())
            .map(|s| print!("{}", s))
            .map_err(|source| ConfigError::Parse {
                origin: "default scene".to_string(),
                source,
            })
    } else {
        unreachable!()
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(run_matches: &ArgMatches) -> Result<(), ConfigError> {
    let parameter_file = run_matches
        .value_of("SIMULATION_CONFIG")
        .ok_or_else(|| ConfigError::InvalidScene("missing simulation config".to_string()))?;
    let overwrite_file = run_matches.value_of("OVERWRITE_CONFIG_FILE").map(Path::new);
    let simulation_params = SimulationParams::load_yaml(Path::new(parameter_file), overwrite_file)?;
    log::info!("{:?}", simulation_params);

    let scene_file_path = run_matches
        .value_of("SCENE_CONFIG")
        .ok_or_else(|| ConfigError::InvalidScene("missing scene config".to_string()))?;
    let scene_config = SceneConfig::load_yaml(Path::new(scene_file_path))?;
    log::debug!("{:?}", scene_config);

    let steps_str = run_matches.value_of("STEPS").unwrap_or(DEFAULT_STEPS);
    let steps: usize = steps_str.parse().map_err(|_| ConfigError::InvalidParameter {
        name: "steps",
        reason: format!("expected a non-negative integer, got `{}`", steps_str),
    })?;

    let counters_enabled = run_matches.is_present("STATISTICS_ENABLED");
    let statistics_path_opt = run_matches.value_of("STATISTICS_PATH");

    let mut fluid_simulation = init_fluid_sim(simulation_params, &scene_config, counters_enabled)?;

    for step in 0..steps {
        fluid_simulation.advance(simulation_params.dt);
        if (step + 1) % PROGRESS_INTERVAL == 0 {
            log::info!(
                "step {} time {:.3}s average density error {:.4}",
                fluid_simulation.step_number(),
                fluid_simulation.time(),
                fluid_simulation.average_density_error()
            );
        }
    }

    if counters_enabled {
        match write_statistics(&fluid_simulation) {
            Ok(s) => {
                print!("{}", s);
                if let Some(statistics_path) = statistics_path_opt {
                    std::fs::write(statistics_path, s).map_err(|source| ConfigError::Io {
                        path: statistics_path.to_string(),
                        source,
                    })?;
                }
            }
            Err(e) => log::error!("failed formatting statistics: {}", e),
        }
    }

    print_summary(&fluid_simulation);
    Ok(())
}

fn print_summary(fluid_simulation: &FluidSimulation) {
    let positions = fluid_simulation.positions();
    if positions.is_empty() {
        println!("simulated {} steps without particles", fluid_simulation.step_number());
        return;
    }

    let (min, max) = positions.iter().fold(
        (V3::repeat(FT::INFINITY), V3::repeat(FT::NEG_INFINITY)),
        |(min, max), p| (min.inf(p), max.sup(p)),
    );
    println!(
        "simulated {} steps ({:.3}s) of {} particles, bounds [{:.3}, {:.3}, {:.3}] to [{:.3}, {:.3}, {:.3}]",
        fluid_simulation.step_number(),
        fluid_simulation.time(),
        fluid_simulation.particle_count(),
        min.x,
        min.y,
        min.z,
        max.x,
        max.y,
        max.z
    );
}
