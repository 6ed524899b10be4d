use chainlib::{blockchain::Blockchain, utxo::UtxoIndex};
use std::{env, process::exit};

fn main() {
    let Some(path) = env::args().nth(1) else {
        eprintln!("Usage: print_chain <ledger_path>");
        exit(1);
    };

    let chain = match Blockchain::open(&path) {
        Ok(chain) => chain,
        Err(e) => {
            eprintln!("failed to open ledger: {e}");
            exit(1);
        }
    };

    let target_bits = chain.target_bits();
    for block in chain.iter() {
        match block {
            Ok(block) => {
                let valid = block.is_valid(target_bits).unwrap_or(false);
                println!("============ Block {} ============", block.hash);
                match block.prev_block_hash {
                    Some(prev) => println!("Prev. block: {prev}"),
                    None => println!("Prev. block: (genesis)"),
                }
                println!("Timestamp: {}", block.timestamp);
                println!("PoW: {valid} (nonce {})", block.nonce);
                for transaction in &block.transactions {
                    println!("{transaction:#?}");
                }
                println!();
            }
            Err(e) => {
                eprintln!("failed to read block: {e}");
                exit(1);
            }
        }
    }

    match UtxoIndex::rebuild(&chain) {
        Ok(utxos) => println!("{} unspent outputs", utxos.len()),
        Err(e) => eprintln!("failed to index outputs: {e}"),
    }
}
