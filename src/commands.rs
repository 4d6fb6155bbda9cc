fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod show {
    use std::io::Write as _;

    use crate::system;

    #[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub enum State {
        /// A human readable summary.
        Str,
        /// The registers or records as read from the device, in JSON.
        Raw,
    }

    /// Read the machine and print its state.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        system: system::Args,
        #[arg(long, value_enum, default_value_t = State::Str)]
        state: State,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the connection")]
        Connect(#[source] system::Error),
        #[error("the machine did not respond")]
        NoData,
        #[error("could not serialize the state to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let machine = super::runtime()
            .map_err(Error::Runtime)?
            .block_on(system::connect(&args.system))
            .map_err(Error::Connect)?;
        if !machine.is_synced() {
            return Err(Error::NoData);
        }
        let mut stdout = std::io::stdout().lock();
        match args.state {
            State::Str => writeln!(stdout, "{machine}").map_err(Error::WriteStdout),
            State::Raw => {
                serde_json::to_writer_pretty(&mut stdout, &machine.raw_state())
                    .map_err(Error::SerializeJson)?;
                writeln!(stdout).map_err(Error::WriteStdout)
            }
        }
    }
}

pub mod zones {
    use crate::{output, system};

    /// List the zones of the machine.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        system: system::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the connection")]
        Connect(#[source] system::Error),
        #[error("the machine did not respond")]
        NoData,
        #[error("could not output the zones")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let machine = super::runtime()
            .map_err(Error::Runtime)?
            .block_on(system::connect(&args.system))
            .map_err(Error::Connect)?;
        if !machine.is_synced() {
            return Err(Error::NoData);
        }
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Zone", "Name", "On", "Mode", "Speed", "Setpoint", "Temp", "Min", "Max", "Demand",
            ])
            .map_err(Error::Output)?;
        for row in machine.zone_rows() {
            output
                .result(
                    || {
                        vec![
                            row.zone.to_string(),
                            row.name.clone(),
                            row.on.to_string(),
                            row.mode.clone(),
                            row.speed.clone(),
                            row.setpoint.to_string(),
                            row.temperature.to_string(),
                            row.min_temperature.to_string(),
                            row.max_temperature.to_string(),
                            row.air_request.to_string(),
                        ]
                    },
                    || &row,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod set {
    use std::io::Write as _;

    use crate::discovery::ZoneId;
    use crate::system::{self, Setting};

    /// Change a single setting of the machine or one of its zones.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        system: system::Args,
        /// The zone to change. Machine wide settings ignore it.
        #[arg(long, short = 'z')]
        zone: Option<ZoneId>,
        /// Re-read the machine after the change and print its state.
        #[arg(long)]
        show: bool,
        #[command(subcommand)]
        setting: Setting,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the connection")]
        Connect(#[source] system::Error),
        #[error("could not apply the setting")]
        Apply(#[source] system::ApplyError),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let machine = super::runtime().map_err(Error::Runtime)?.block_on(async {
            let mut machine = system::connect(&args.system).await.map_err(Error::Connect)?;
            machine.apply(args.zone, &args.setting).await.map_err(Error::Apply)?;
            if args.show {
                machine.refresh().await;
            }
            Ok::<_, Error>(machine)
        })?;
        if args.show {
            writeln!(std::io::stdout().lock(), "{machine}").map_err(Error::WriteStdout)?;
        }
        Ok(())
    }
}

pub mod registers {
    use crate::registers::{Field, Mode};
    use crate::{aido, innobus, output};

    /// Search and output the known register fields.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list fields whose name, description or location contains this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct FieldSchema {
        pub table: &'static str,
        pub location: String,
        pub name: &'static str,
        pub mode: Mode,
        pub kind: &'static str,
        pub values: String,
        pub minimum: Option<f32>,
        pub maximum: Option<f32>,
        pub description: &'static str,
    }

    impl FieldSchema {
        fn new(table: &'static str, field: &Field) -> Self {
            Self {
                table,
                location: field.bits.to_string(),
                name: field.name,
                mode: field.mode,
                kind: field.kind.name(),
                values: field.kind.values(),
                minimum: field.minimum,
                maximum: field.maximum,
                description: field.description,
            }
        }

        pub fn all_fields() -> impl Iterator<Item = Self> {
            let tables: [(&'static str, &'static [Field]); 3] = [
                ("innobus-machine", innobus::machine::FIELDS),
                ("innobus-zone", innobus::zone::FIELDS),
                ("aido", aido::fields::FIELDS),
            ];
            tables
                .into_iter()
                .flat_map(|(table, fields)| fields.iter().map(move |f| Self::new(table, f)))
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let upper = pattern.to_uppercase();
            self.name.contains(&upper)
                || self.description.to_uppercase().contains(&upper)
                || self.table.contains(&pattern.to_lowercase())
                || self.location == pattern
        }

        fn table_row(&self) -> Vec<String> {
            vec![
                self.table.to_string(),
                self.location.clone(),
                self.name.to_string(),
                self.mode.to_string(),
                self.kind.to_string(),
                self.values.clone(),
                self.minimum.map(|v| v.to_string()).unwrap_or_default(),
                self.maximum.map(|v| v.to_string()).unwrap_or_default(),
                self.description.to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Table",
                "Word",
                "Name",
                "Mode",
                "Kind",
                "Values",
                "Min",
                "Max",
                "Description",
            ])
            .map_err(Error::Output)?;
        for field in FieldSchema::all_fields() {
            if let Some(pattern) = &args.filter {
                if !field.is_match(pattern) {
                    continue;
                }
            }
            output.result(|| field.table_row(), || &field).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}
