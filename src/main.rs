use clap::{App, AppSettings, Arg};
use log::error;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use std::process;

use transcode_fleet::CliArgs;

fn main() {
    let matches = App::new(clap::crate_name!())
        .version(clap::crate_version!())
        .about(
            "A distributed video transcoder that splits a file into segments \
             and fans them out across a fleet of remote hosts.",
        )
        .author(clap::crate_authors!())
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name("hosts")
                .short("c")
                .long("hosts")
                .value_name("hostnames")
                .use_delimiter(true)
                .takes_value(true)
                .required(true)
                .help("Comma-separated list of transcoding hosts"),
        )
        .arg(
            Arg::with_name("length")
                .short("l")
                .long("length")
                .value_name("seconds")
                .takes_value(true)
                .help("The length of video segments in seconds"),
        )
        .arg(
            Arg::with_name("qlimit")
                .short("q")
                .long("qlimit")
                .value_name("count")
                .takes_value(true)
                .help("Stop pulling new segments once the shared queue drops below this many"),
        )
        .arg(
            Arg::with_name("tmp")
                .short("t")
                .long("tmp")
                .value_name("path")
                .takes_value(true)
                .help("The path to the local temporary directory"),
        )
        .arg(
            Arg::with_name("keep")
                .short("k")
                .long("keep")
                .help("Don't clean up local or remote temporary files"),
        )
        .arg(
            Arg::with_name("remote-tmp")
                .long("remote-tmp")
                .value_name("path")
                .takes_value(true)
                .help("The scratch directory to use on each remote host"),
        )
        .arg(
            Arg::with_name("output-suffix")
                .long("output-suffix")
                .value_name("suffix")
                .takes_value(true)
                .help("Suffix appended to a segment's basename to name its transcoded output"),
        )
        .arg(
            Arg::with_name("transcoder")
                .long("transcoder")
                .value_name("binary")
                .takes_value(true)
                .help("The transcoder binary to invoke on remote hosts"),
        )
        .arg(
            Arg::with_name("ssh")
                .long("ssh")
                .value_name("binary")
                .takes_value(true)
                .help("The ssh binary to shell out to"),
        )
        .arg(
            Arg::with_name("scp")
                .long("scp")
                .value_name("binary")
                .takes_value(true)
                .help("The scp binary to shell out to"),
        )
        .arg(
            Arg::with_name("IN")
                .help("The original video file")
                .required(true),
        )
        .arg(
            Arg::with_name("OUT")
                .help("The output video file")
                .required(true),
        )
        .arg(
            Arg::with_name("transcoder-args")
                .value_name("TRANSCODER OPTIONS")
                .multiple(true)
                .help(
                    "Options/flags passed to the transcoder for each\n\
                     segment. Input/output file names are added by the\n\
                     application, so there is no need for that either.\n\
                     This is the last positional argument and needs to be\n\
                     preceeded by double hyphens (--) as in:\n\
                     transcode-fleet -c h1,h2 in.mp4 out.mp4 -- -c:v libx264\n\
                     -crf 26 -preset veryslow -profile:v high -level 4.2\n\
                     -pix_fmt yuv420p\n\
                     This is also the default that is used if no options\n\
                     are provided.",
                ),
        )
        .get_matches();

    // If we get here, unwrap is safe on mandatory arguments
    let input = matches.value_of("IN").unwrap();
    let output = matches.value_of("OUT").unwrap();
    let hosts = matches.values_of("hosts").unwrap().collect();
    let transcoder_args: Vec<&str> = matches
        .values_of("transcoder-args")
        .map(|a| a.collect())
        .unwrap_or_default();

    let args = CliArgs {
        input,
        output,
        hosts,
        segment_length_secs: matches.value_of("length"),
        qlimit: matches.value_of("qlimit"),
        tmp_dir: matches.value_of("tmp"),
        keep: matches.is_present("keep"),
        remote_tmp: matches.value_of("remote-tmp"),
        output_suffix: matches.value_of("output-suffix"),
        transcoder: matches.value_of("transcoder"),
        ssh_bin: matches.value_of("ssh"),
        scp_bin: matches.value_of("scp"),
        transcoder_args,
    };

    TermLogger::init(
        LevelFilter::Info,
        ConfigBuilder::new()
            .set_time_offset_to_local()
            .expect("unable to determine time offset")
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("failed initializing logger");

    if let Err(e) = transcode_fleet::run(args) {
        error!("{}", e);
        process::exit(1);
    }
}
