use clap::Parser;
use training::TrainerArgs;

fn main() -> anyhow::Result<()> {
    let args = TrainerArgs::parse();
    training::run_train(args)
}
