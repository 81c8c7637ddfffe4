use clap::Parser as ClapParser;
use std::{fs, process, rc::Rc};

use picovm::{
    BytecodeDecoder, Error, HeapSettings, HostFunction, ImageHeader, Instruction, RomItems,
    Section, TypeCode, Vm, VmCreateInfo,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bytecode image to load
    image: String,

    /// Print the image header and section sizes
    #[arg(long)]
    info: bool,

    /// Disassemble every function in the ROM section
    #[arg(long)]
    disassemble: bool,

    /// Call the function exported under this id
    #[arg(long, value_name = "EXPORT_ID")]
    call: Option<u16>,

    /// Numeric argument for --call, may be repeated
    #[arg(long = "arg", value_name = "NUMBER", allow_hyphen_values = true)]
    args: Vec<f64>,

    /// Stop the call after this many instructions
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Heap limit in bytes
    #[arg(long, default_value_t = HeapSettings::default().max_heap_size)]
    max_heap: usize,

    /// Write a snapshot of the VM state to this path after the call
    #[arg(long, value_name = "PATH")]
    snapshot: Option<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let image = match fs::read(&cli.image) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading image '{}': {}", cli.image, err);
            process::exit(1);
        }
    };
    let header = match ImageHeader::parse(&image) {
        Ok(header) => header,
        Err(err) => {
            eprintln!("Error parsing {}: {}", cli.image, err);
            process::exit(1);
        }
    };

    if cli.info {
        print_info(&image, &header);
    }
    if cli.disassemble {
        disassemble(&image, &header);
    }
    if cli.call.is_none() && cli.snapshot.is_none() {
        return;
    }

    let info = VmCreateInfo {
        heap: HeapSettings {
            max_heap_size: cli.max_heap,
            ..HeapSettings::default()
        },
        ..VmCreateInfo::default()
    };
    let mut vm = match Vm::restore_with(&image, info, |_| Some(print_host())) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error restoring {}: {}", cli.image, err);
            process::exit(1);
        }
    };

    if let Some(id) = cli.call {
        vm.stop_after_n_instructions(cli.max_instructions);
        match run_export(&mut vm, id, &cli.args) {
            Ok(result) => println!("{}", result),
            Err(err) => {
                eprintln!("Error calling export {}: {}", id, err);
                process::exit(1);
            }
        }
    }

    if cli.info {
        let stats = vm.memory_stats();
        println!(
            "heap: {} used / {} capacity, high water {}, {} collection(s)",
            stats.heap_used, stats.heap_capacity, stats.heap_high_water_mark, stats.gc_count
        );
    }

    if let Some(path) = &cli.snapshot {
        let written = vm
            .create_snapshot()
            .map_err(|err| err.to_string())
            .and_then(|bytes| fs::write(path, bytes).map_err(|err| err.to_string()));
        if let Err(err) = written {
            eprintln!("Error writing snapshot '{}': {}", path, err);
            process::exit(1);
        }
    }
}

/// Host function bound to every import: prints its arguments.
fn print_host() -> HostFunction {
    Rc::new(|vm, id, args| {
        let rendered: Vec<String> = args.iter().map(|arg| vm.value_to_string(*arg)).collect();
        println!("[host {id}] {}", rendered.join(" "));
        Ok(picovm::Value::Undefined)
    })
}

fn run_export(vm: &mut Vm<'_>, id: u16, numbers: &[f64]) -> Result<String, Error> {
    let function = vm.resolve_export(id)?;
    // Arguments may be heap numbers; keep them in handles until the call.
    let mut handles = Vec::with_capacity(numbers.len());
    for &n in numbers {
        let value = vm.new_number(n)?;
        handles.push(vm.new_handle(value));
    }
    let args = handles
        .iter()
        .map(|handle| vm.handle_value(handle))
        .collect::<Result<Vec<_>, _>>()?;
    let result = vm.call(function, &args);
    for handle in handles {
        vm.release_handle(handle)?;
    }
    Ok(vm.value_to_string(result?))
}

fn print_info(image: &[u8], header: &ImageHeader) {
    println!("bytecode version {}", header.bytecode_version);
    println!("engine version   {}", header.required_engine_version);
    println!("size             {} bytes", image.len());
    println!("crc              {:#06x}", header.crc);
    println!("features         {:#x}", header.required_features);
    for section in Section::ALL {
        let range = header.section_range(section);
        println!(
            "{:<16} {:#06x}..{:#06x} ({} bytes)",
            format!("{section:?}"),
            range.start,
            range.end,
            range.len()
        );
    }
}

fn disassemble(image: &[u8], header: &ImageHeader) {
    for (body, item) in RomItems::new(image, header) {
        if item.type_code() != TypeCode::Function || item.size() == 0 {
            continue;
        }
        println!("function @{body:#06x} (max stack {})", image[body]);
        let mut decoder = BytecodeDecoder::with_range(image, body + 1, body + item.size());
        while !decoder.is_at_end() {
            let at = decoder.offset();
            match decoder.decode_next() {
                Ok(instruction) => {
                    println!("  {at:#06x}: {instruction}");
                    if matches!(instruction, Instruction::Await) {
                        decoder.skip_await_stub();
                    }
                }
                Err(err) => {
                    println!("  {at:#06x}: <{err}>");
                    break;
                }
            }
        }
    }
}
