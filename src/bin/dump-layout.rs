use clap::{Parser, ValueEnum};
use dotnet_marshal::{
    FieldKind, HasLayout, LibraryStubSource, ManagedValue, MarshalConfig, MarshalEngine, Scalar,
    StaticStubSource, StubRegistry, StubSource, TypeDecl, TypeHandle, TypeRegistry,
};
use dotnetdll::prelude::{ExplicitLayout, Layout, SequentialLayout};
use std::{error::Error, path::PathBuf, process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LayoutKind {
    Auto,
    Sequential,
    Explicit,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Compute the native layout of a structure and optionally marshal an instance"
)]
struct Args {
    /// Name of the structure (also used to look up stubs)
    type_name: String,
    /// A field as NAME:TYPE or NAME:TYPE@OFFSET. TYPE is a scalar (i8, u8, i16, u16, i32,
    /// u32, i64, u64, ptr, f32, f64), `text` or `iface`
    #[arg(short, long = "field", value_name = "FIELD")]
    fields: Vec<String>,
    #[arg(short, long, value_enum, default_value_t = LayoutKind::Sequential)]
    layout: LayoutKind,
    /// Packing size for sequential layout (0 = default)
    #[arg(long, default_value_t = 0)]
    pack: usize,
    /// Minimum class size (0 = computed)
    #[arg(long, default_value_t = 0)]
    size: usize,
    /// Values for the scalar fields, in declaration order; marshals an instance and dumps
    /// the native bytes
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    values: Vec<String>,
    /// Stub library to resolve stubs from (defaults to DOTNET_MARSHAL_STUB_LIBRARY)
    #[arg(long)]
    stub_library: Option<String>,
    /// Directory containing the stub library (defaults to DOTNET_MARSHAL_STUB_PATH)
    #[arg(long)]
    stub_path: Option<PathBuf>,
}

type CliResult<T> = Result<T, Box<dyn Error>>;

fn parse_field(arg: &str) -> CliResult<(String, Option<usize>, FieldKind)> {
    let (name, rest) = arg
        .split_once(':')
        .ok_or_else(|| format!("field '{}' must look like NAME:TYPE[@OFFSET]", arg))?;
    let (tag, offset) = match rest.split_once('@') {
        Some((tag, ofs)) => (tag, Some(ofs.parse::<usize>()?)),
        None => (rest, None),
    };
    let kind = match tag {
        "text" => FieldKind::Text,
        "iface" => FieldKind::Interface,
        _ => FieldKind::Scalar(
            Scalar::from_tag(tag).ok_or_else(|| format!("unknown field type '{}'", tag))?,
        ),
    };
    Ok((name.to_string(), offset, kind))
}

fn encode(scalar: Scalar, text: &str) -> CliResult<Vec<u8>> {
    macro_rules! ne {
        ($t:ty) => {
            text.parse::<$t>()?.to_ne_bytes().to_vec()
        };
    }
    Ok(match scalar {
        Scalar::Int8 => ne!(i8),
        Scalar::UInt8 => ne!(u8),
        Scalar::Int16 => ne!(i16),
        Scalar::UInt16 => ne!(u16),
        Scalar::Int32 => ne!(i32),
        Scalar::UInt32 => ne!(u32),
        Scalar::Int64 => ne!(i64),
        Scalar::UInt64 => ne!(u64),
        Scalar::NativeInt => ne!(isize),
        Scalar::Float32 => ne!(f32),
        Scalar::Float64 => ne!(f64),
    })
}

fn hex_dump(bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:04x}: {}", i * 16, hex.join(" "));
    }
}

fn stub_source(args: &Args) -> CliResult<Arc<dyn StubSource>> {
    let mut config = MarshalConfig::from_env();
    if let Some(path) = &args.stub_path {
        config.stub_path = path.clone();
    }
    if let Some(name) = &args.stub_library {
        config.stub_library = Some(name.clone());
    }
    let source: Arc<dyn StubSource> = match LibraryStubSource::from_config(&config) {
        Some(lib) => Arc::new(lib?),
        None => Arc::new(StaticStubSource::new()),
    };
    Ok(source)
}

fn print_type_info(engine: &MarshalEngine, ty: &TypeHandle) {
    let def = ty.definition();
    println!(
        "Type: {} ({:?}, {:?})",
        def.name,
        def.kind,
        engine.types().layout_class(ty)
    );
    match engine.native_size(ty) {
        Ok(size) => println!("Native size: {} (alignment {})", size, def.layout.alignment()),
        Err(e) => println!("Native size: unavailable ({})", e),
    }

    println!("\nFields:");
    for (name, field) in def.layout.ordered_fields() {
        let range = field.as_range();
        println!(
            "  - {:>4}..{:<4} {}: {}",
            range.start,
            range.end,
            name,
            field.layout.type_tag()
        );
    }

    let set = (
        engine.stubs().try_marshal_stub(ty),
        engine.stubs().try_unmarshal_stub(ty),
        engine.stubs().destroy_stub(ty),
    );
    println!("\nStubs:");
    println!("  marshal:   {:?}", set.0);
    println!("  unmarshal: {:?}", set.1);
    println!("  destroy:   {:?} (invalid layout: {})", set.2 .0, set.2 .1);
}

fn marshal_instance(
    engine: &MarshalEngine,
    ty: &TypeHandle,
    fields: &[(String, Option<usize>, FieldKind)],
    values: &[String],
) -> CliResult<()> {
    let value = ManagedValue::instantiate(ty);
    let scalars = fields.iter().filter_map(|(name, _, kind)| match kind {
        FieldKind::Scalar(s) => Some((name, *s)),
        _ => None,
    });
    for ((name, scalar), text) in scalars.zip(values) {
        let offset = engine.field_offset(ty, name)?;
        value.write_field_bytes(offset, &encode(scalar, text.trim())?)?;
    }

    let size = engine.native_size(ty)?;
    let buffer = engine.heap().alloc(size)?;
    let marshaled = unsafe { engine.to_native(&value, buffer, false) };
    if marshaled.is_ok() {
        println!("\nNative bytes:");
        hex_dump(unsafe { std::slice::from_raw_parts(buffer.as_ptr(), size) });
    }
    let destroyed = unsafe { engine.destroy(buffer, ty) };
    unsafe { engine.heap().free(buffer) };
    marshaled?;
    destroyed?;
    Ok(())
}

fn run(args: Args) -> CliResult<()> {
    let fields = args
        .fields
        .iter()
        .map(|f| parse_field(f))
        .collect::<CliResult<Vec<_>>>()?;

    let layout = match args.layout {
        LayoutKind::Auto => Layout::Automatic,
        LayoutKind::Sequential if args.pack == 0 && args.size == 0 => Layout::Sequential(None),
        LayoutKind::Sequential => Layout::Sequential(Some(SequentialLayout {
            packing_size: args.pack,
            class_size: args.size,
        })),
        LayoutKind::Explicit if args.size == 0 => Layout::Explicit(None),
        LayoutKind::Explicit => Layout::Explicit(Some(ExplicitLayout {
            class_size: args.size,
        })),
    };

    let mut decl = TypeDecl::structure(args.type_name.clone()).layout(layout);
    for (name, offset, kind) in &fields {
        decl = match offset {
            Some(o) => decl.field_at(name.clone(), *o, kind.clone()),
            None => decl.field(name.clone(), kind.clone()),
        };
    }

    let types = Arc::new(TypeRegistry::new());
    let ty = types.define(decl)?;
    let engine = MarshalEngine::new(types, Arc::new(StubRegistry::new(stub_source(&args)?)))
        .with_config(MarshalConfig::from_env());

    print_type_info(&engine, &ty);

    if !args.values.is_empty() {
        marshal_instance(&engine, &ty, &fields, &args.values)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
