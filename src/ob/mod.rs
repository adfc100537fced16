//! The object manager.
//!
//! Everything a handle can name is an [`Object`]: a typed header around
//! one of the executive's bodies. Objects are reference counted; named
//! objects additionally live in a directory namespace rooted at `\`.
//! Types carry the delete and parse callbacks; deletion runs when the
//! last reference drops (never for permanent objects).

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::{InterruptTicketMutex, OnceCell};

use crate::io::file::FileObject;
use crate::ke::thread::Thread;
use crate::ke::wait::Dispatch;
use crate::ke::{Event, Mutex, Process, Semaphore, Timer};
use crate::mm::section::Section;
use crate::status::{KeStatus, Status};

/// Anything a thread can wait on through the object surface.
pub trait Waitable {
	fn dispatch(&self) -> &dyn Dispatch;
}

macro_rules! impl_waitable {
	($($ty:ty),+) => {
		$(impl Waitable for $ty {
			fn dispatch(&self) -> &dyn Dispatch {
				self
			}
		})+
	};
}

impl_waitable!(Event, Mutex, Semaphore, Timer, Thread, Process);

pub type Handle = u64;

/// The typed body of an object.
#[derive(Clone)]
pub enum ObjectBody {
	Event(Arc<Event>),
	Mutex(Arc<Mutex>),
	Semaphore(Arc<Semaphore>),
	Timer(Arc<Timer>),
	Thread(Arc<Thread>),
	Process(Arc<Process>),
	Section(Arc<Section>),
	File(Arc<FileObject>),
	Directory(Arc<Directory>),
}

/// A registered object type.
pub struct ObjectType {
	pub name: &'static str,
	/// Runs as the last reference drops. Sections and files use this to
	/// tear their page arrays down; most types need nothing beyond their
	/// body's own teardown.
	pub delete: Option<fn(&Object)>,
	/// Resolves a residual path inside an object of this type, for
	/// namespaces (file systems) grafted into the object tree.
	pub parse: Option<fn(&Arc<Object>, &str) -> Status<Arc<Object>>>,
}

static OBJECT_TYPES: InterruptTicketMutex<Vec<&'static ObjectType>> =
	InterruptTicketMutex::new(Vec::new());

/// Registers a type and returns its permanent registration.
pub fn create_object_type(object_type: ObjectType) -> &'static ObjectType {
	let registered: &'static ObjectType = alloc::boxed::Box::leak(alloc::boxed::Box::new(object_type));
	OBJECT_TYPES.lock().push(registered);
	registered
}

/// The header every object carries.
pub struct Object {
	pub object_type: &'static ObjectType,
	pub name: Option<String>,
	/// Permanent objects survive their last reference.
	permanent: AtomicBool,
	pub body: ObjectBody,
}

impl Object {
	pub fn body_dispatch(&self) -> Option<&dyn Dispatch> {
		match &self.body {
			ObjectBody::Event(event) => Some(&**event),
			ObjectBody::Mutex(mutex) => Some(&**mutex),
			ObjectBody::Semaphore(semaphore) => Some(&**semaphore),
			ObjectBody::Timer(timer) => Some(&**timer),
			ObjectBody::Thread(thread) => Some(&**thread),
			ObjectBody::Process(process) => Some(&**process),
			_ => None,
		}
	}

	pub fn make_permanent(&self) {
		self.permanent.store(true, Ordering::Release);
	}

	pub fn is_permanent(&self) -> bool {
		self.permanent.load(Ordering::Acquire)
	}
}

impl Drop for Object {
	fn drop(&mut self) {
		if let Some(delete) = self.object_type.delete {
			delete(self);
		}
	}
}

/// A directory in the object namespace.
pub struct Directory {
	entries: InterruptTicketMutex<HashMap<String, Arc<Object>, RandomState>>,
}

impl Directory {
	fn new() -> Arc<Directory> {
		Arc::new(Directory {
			entries: InterruptTicketMutex::new(HashMap::with_hasher(RandomState::with_seeds(
				0, 0, 0, 0,
			))),
		})
	}

	fn insert(&self, name: &str, object: Arc<Object>) -> Status {
		let mut entries = self.entries.lock();
		if entries.contains_key(name) {
			return Err(KeStatus::AlreadyLinked);
		}
		entries.insert(name.to_string(), object);
		Ok(())
	}

	fn find(&self, name: &str) -> Option<Arc<Object>> {
		self.entries.lock().get(name).cloned()
	}

	pub fn remove(&self, name: &str) -> Status {
		let mut entries = self.entries.lock();
		let object = entries.get(name).ok_or(KeStatus::NameNotFound)?;
		if object.is_permanent() {
			return Err(KeStatus::InvalidParameter);
		}
		entries.remove(name);
		Ok(())
	}
}

static ROOT_DIRECTORY: OnceCell<Arc<Object>> = OnceCell::new();
static DIRECTORY_TYPE: OnceCell<&'static ObjectType> = OnceCell::new();

macro_rules! builtin_type {
	($cell:ident, $accessor:ident, $name:literal) => {
		static $cell: OnceCell<&'static ObjectType> = OnceCell::new();

		pub fn $accessor() -> &'static ObjectType {
			$cell.get().expect("the object manager has not been initialized yet")
		}
	};
}

builtin_type!(EVENT_TYPE, event_type, "Event");
builtin_type!(MUTEX_TYPE, mutex_type, "Mutex");
builtin_type!(SEMAPHORE_TYPE, semaphore_type, "Semaphore");
builtin_type!(TIMER_TYPE, timer_type, "Timer");
builtin_type!(THREAD_TYPE, thread_type, "Thread");
builtin_type!(PROCESS_TYPE, process_type, "Process");
builtin_type!(SECTION_TYPE, section_type, "Section");
builtin_type!(FILE_TYPE, file_type, "File");

pub fn init() {
	let directory_type = create_object_type(ObjectType {
		name: "Directory",
		delete: None,
		parse: None,
	});
	DIRECTORY_TYPE.set(directory_type).ok();

	// The bodies of these types tear themselves down when the last
	// reference drops (sections and files walk their page arrays there),
	// so none of them needs an extra delete callback.
	for (cell, name) in [
		(&EVENT_TYPE, "Event"),
		(&MUTEX_TYPE, "Mutex"),
		(&SEMAPHORE_TYPE, "Semaphore"),
		(&TIMER_TYPE, "Timer"),
		(&THREAD_TYPE, "Thread"),
		(&PROCESS_TYPE, "Process"),
		(&SECTION_TYPE, "Section"),
		(&FILE_TYPE, "File"),
	] {
		cell.set(create_object_type(ObjectType {
			name,
			delete: None,
			parse: None,
		}))
		.ok();
	}

	let root = Arc::new(Object {
		object_type: directory_type,
		name: Some("\\".to_string()),
		permanent: AtomicBool::new(true),
		body: ObjectBody::Directory(Directory::new()),
	});
	ROOT_DIRECTORY.set(root).ok();

	debug!("Object manager online");
}

pub fn root_directory() -> &'static Arc<Object> {
	ROOT_DIRECTORY
		.get()
		.expect("the object manager has not been initialized yet")
}

/// Creates a directory object inside `parent` (the root by default).
pub fn create_directory(parent: Option<&Arc<Object>>, name: &str) -> Status<Arc<Object>> {
	create_object(
		ObjectBody::Directory(Directory::new()),
		DIRECTORY_TYPE.get().unwrap(),
		Some(name),
		parent,
	)
}

/// Allocates an object and, when named, links it into a directory.
pub fn create_object(
	body: ObjectBody,
	object_type: &'static ObjectType,
	name: Option<&str>,
	parent: Option<&Arc<Object>>,
) -> Status<Arc<Object>> {
	let object = Arc::new(Object {
		object_type,
		name: name.map(String::from),
		permanent: AtomicBool::new(false),
		body,
	});

	if let Some(name) = name {
		let parent = parent.unwrap_or_else(|| root_directory());
		let ObjectBody::Directory(directory) = &parent.body else {
			return Err(KeStatus::TypeMismatch);
		};
		directory.insert(name, object.clone())?;
	}

	Ok(object)
}

/// Adds a reference to an object already in hand.
pub fn reference_by_pointer(object: &Arc<Object>) -> Arc<Object> {
	object.clone()
}

/// Drops a reference. The object goes away with its last one, unless it
/// is permanent and still linked in the namespace.
pub fn dereference(object: Arc<Object>) {
	drop(object);
}

/// Resolves `path` from `root` (the namespace root by default), calling
/// into per-type parse callbacks when the walk reaches a non-directory.
pub fn open_object_by_name(path: &str, root: Option<Arc<Object>>) -> Status<Arc<Object>> {
	let mut current = root.unwrap_or_else(|| root_directory().clone());

	let mut components = path.split(['\\', '/']).filter(|c| !c.is_empty());

	while let Some(component) = components.next() {
		match &current.body {
			ObjectBody::Directory(directory) => {
				current = directory.find(component).ok_or(KeStatus::NameNotFound)?;
			}
			_ => {
				// A non-directory mid-path: hand the residual to the
				// object's parser.
				let Some(parse) = current.object_type.parse else {
					return Err(KeStatus::NameNotFound);
				};

				let mut residual = component.to_string();
				for rest in components {
					residual.push('/');
					residual.push_str(rest);
				}
				return parse(&current, &residual);
			}
		}
	}

	Ok(current)
}

/// The per-process handle table.
pub struct HandleTable {
	map: InterruptTicketMutex<HashMap<Handle, Arc<Object>, RandomState>>,
	next_handle: AtomicU64,
}

impl HandleTable {
	pub fn new() -> Self {
		Self {
			map: InterruptTicketMutex::new(HashMap::with_hasher(RandomState::with_seeds(
				0, 0, 0, 0,
			))),
			next_handle: AtomicU64::new(4),
		}
	}

	/// Inserts an object, returning its new handle.
	pub fn insert(&self, object: Arc<Object>) -> Handle {
		let handle = self.next_handle.fetch_add(4, Ordering::Relaxed);
		self.map.lock().insert(handle, object);
		handle
	}

	pub fn get(&self, handle: Handle) -> Option<Arc<Object>> {
		self.map.lock().get(&handle).cloned()
	}

	pub fn remove(&self, handle: Handle) -> Option<Arc<Object>> {
		self.map.lock().remove(&handle)
	}
}

/// Resolves a handle of the calling process, optionally demanding a type.
pub fn reference_by_handle(
	handle: Handle,
	expected_type: Option<&'static ObjectType>,
) -> Status<Arc<Object>> {
	let process = crate::ke::process::attached_process();
	let object = process
		.handle_table
		.get(handle)
		.ok_or(KeStatus::InvalidParameter)?;

	if let Some(expected) = expected_type {
		if !core::ptr::eq(object.object_type, expected) {
			return Err(KeStatus::TypeMismatch);
		}
	}

	Ok(object)
}

/// Closes a handle of the calling process.
pub fn close(handle: Handle) -> Status {
	let process = crate::ke::process::attached_process();
	process
		.handle_table
		.remove(handle)
		.map(drop)
		.ok_or(KeStatus::InvalidParameter)
}
