use std::fs::{self, File};
use std::io::Write;
use std::time::{Duration, Instant};

use microsym::arch::Architecture;
use microsym::config::RecoveryConfig;
use microsym::loader::{Loader, RawLoader};
use microsym::recovery::symbexec;
use microsym::solver::SimplifySolver;
use microsym::x86_32::X86_32Decoder;


fn main() {
    bench("counter", &counter(), 64);
    bench("fill", &fill(), 0);
    bench("branches", &branches(12), 0);
}

fn bench(name: &str, code: &[u8], max_visits: usize) {
    let image = RawLoader::new(0x1000, Architecture::x86_32()).load(code).unwrap();
    let mut config = RecoveryConfig { max_visits_per_address: max_visits, ..RecoveryConfig::default() };
    config.set_init_register("esp", 0x8000);
    config.set_init_register("eax", 0);
    config.set_init_register("ecx", 0x40);

    let runs = 10;
    let mut total = Duration::default();
    let mut nodes = 0;
    for _ in 0 .. runs {
        let start = Instant::now();
        let recovery = symbexec(&image, X86_32Decoder::new(), || Ok(SimplifySolver::new()), &config)
            .unwrap();
        total += start.elapsed();
        nodes = recovery.program.len();
    }

    fs::create_dir_all("target/bench").unwrap();
    let mut file = File::create(format!("target/bench/{}.txt", name)).unwrap();
    writeln!(file, "Benchmark for {}\n", name).unwrap();
    writeln!(file, "nodes: {}", nodes).unwrap();
    writeln!(file, "average: {:?}", total / runs).unwrap();
}

/// `inc eax; jmp 0x1000`
fn counter() -> Vec<u8> {
    vec![0x40, 0xeb, 0xfd]
}

/// `mov edi, 0x2000; mov eax, 0xab; rep stosb; hlt`
fn fill() -> Vec<u8> {
    vec![
        0xbf, 0x00, 0x20, 0x00, 0x00,
        0xb8, 0xab, 0x00, 0x00, 0x00,
        0xf3, 0xaa,
        0xf4,
    ]
}

/// `xor ebx, ebx` followed by a chain of `test ebx, ebx; je +2; inc ebx;
/// inc ebx` blocks and a final `hlt`.
fn branches(count: usize) -> Vec<u8> {
    let mut code = vec![0x31, 0xdb];
    for _ in 0 .. count {
        code.extend_from_slice(&[0x85, 0xdb, 0x74, 0x02, 0x43, 0x43]);
    }
    code.push(0xf4);
    code
}
